//! Append-only conversation log.
//!
//! Turns are ordered by arrival at the client. There is no reordering, no
//! dedup and no removal; the UI layer observes changes through [`ConversationStore::subscribe`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::ChatTurn;

pub const DEFAULT_LOCAL_IDENTITY: &str = "User";
pub const DEFAULT_ASSISTANT_IDENTITY: &str = "Helix";

/// Sender names used for the two producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identities {
    pub local: String,
    pub assistant: String,
}

impl Default for Identities {
    fn default() -> Self {
        Self {
            local: DEFAULT_LOCAL_IDENTITY.to_string(),
            assistant: DEFAULT_ASSISTANT_IDENTITY.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    turns: Arc<watch::Sender<Vec<ChatTurn>>>,
    identities: Arc<Identities>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(Identities::default())
    }
}

impl ConversationStore {
    pub fn new(identities: Identities) -> Self {
        let (turns, _) = watch::channel(Vec::new());
        Self {
            turns: Arc::new(turns),
            identities: Arc::new(identities),
        }
    }

    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    /// Optimistic append of something the local user typed.
    pub fn append_local(&self, text: impl Into<String>) -> ChatTurn {
        self.append(ChatTurn::new(self.identities.local.clone(), text))
    }

    /// Append a reply from the assistant.
    pub fn append_remote(&self, text: impl Into<String>) -> ChatTurn {
        self.append(ChatTurn::new(self.identities.assistant.clone(), text))
    }

    fn append(&self, turn: ChatTurn) -> ChatTurn {
        self.turns.send_modify(|turns| turns.push(turn.clone()));
        turn
    }

    /// The full ordered log.
    pub fn turns(&self) -> Vec<ChatTurn> {
        self.turns.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.borrow().is_empty()
    }

    /// Turns appended after the first `from` entries.
    pub fn since(&self, from: usize) -> Vec<ChatTurn> {
        self.turns.borrow().iter().skip(from).cloned().collect()
    }

    /// Change notifications; the value is the full log.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatTurn>> {
        self.turns.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_then_remote_keeps_insertion_order() {
        let store = ConversationStore::default();
        store.append_local("hi");
        store.append_remote("hello");

        assert_eq!(
            store.turns(),
            vec![ChatTurn::new("User", "hi"), ChatTurn::new("Helix", "hello")]
        );
    }

    #[test]
    fn duplicates_are_kept() {
        let store = ConversationStore::default();
        store.append_remote("same");
        store.append_remote("same");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn custom_identities() {
        let store = ConversationStore::new(Identities {
            local: "me".into(),
            assistant: "bot".into(),
        });
        let turn = store.append_remote("x");
        assert_eq!(turn.sender, "bot");
        assert_eq!(store.append_local("y").sender, "me");
    }

    #[test]
    fn since_returns_tail() {
        let store = ConversationStore::default();
        store.append_local("a");
        store.append_local("b");
        store.append_remote("c");
        let tail: Vec<String> = store.since(1).into_iter().map(|t| t.text).collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert!(store.since(10).is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let store = ConversationStore::default();
        let mut rx = store.subscribe();
        let clone = store.clone();

        clone.append_remote("pushed");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
        assert_eq!(store.len(), 1);
    }
}
