//! Outbound side: user-composed messages.
//!
//! The gateway is the only writer to the channel. Every send updates the
//! conversation first (optimistic UI), then hands the frame to the connection
//! actor, which emits it, buffers it, or drops it according to the policy.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::connection::Emitter;
use crate::conversation::ConversationStore;
use crate::error::ChannelError;
use crate::protocol::{Frame, USER_MESSAGE};

pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// What happens to a message sent while the channel is not connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutboundPolicy {
    /// Best effort: the message only exists in the local conversation.
    #[default]
    Drop,
    /// Queue up to `capacity` messages and flush them, in order, on the next connect.
    Buffer { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to a live transport link.
    Emitted,
    /// Queued until the channel is connected again.
    Buffered,
    /// Not sent. Only the optimistic local turn remains.
    Dropped,
}

impl SendOutcome {
    /// Map `Dropped` to [`ChannelError::NotConnected`] for callers that surface it.
    pub fn into_result(self) -> Result<Self, ChannelError> {
        match self {
            Self::Dropped => Err(ChannelError::NotConnected),
            other => Ok(other),
        }
    }
}

#[derive(Clone)]
pub struct OutboundGateway {
    conversation: ConversationStore,
    emitter: Emitter,
    policy: OutboundPolicy,
    event: Arc<str>,
}

impl OutboundGateway {
    pub fn new(conversation: ConversationStore, emitter: Emitter, policy: OutboundPolicy) -> Self {
        Self {
            conversation,
            emitter,
            policy,
            event: Arc::from(USER_MESSAGE),
        }
    }

    /// Emit under a different event name (older servers listen on `user_message`).
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Arc::from(event.into());
        self
    }

    pub fn policy(&self) -> OutboundPolicy {
        self.policy
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Append the local turn and try to emit it. Never fails; see [`SendOutcome`].
    pub async fn send(&self, text: impl Into<String>) -> SendOutcome {
        let text = text.into();
        self.conversation.append_local(text.clone());

        let frame = Frame::new(self.event.as_ref(), Value::String(text));
        let outcome = self.emitter.emit(frame, self.policy).await;
        debug!(event = %self.event, ?outcome, "user message sent");
        outcome
    }
}

impl std::fmt::Debug for OutboundGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGateway")
            .field("policy", &self.policy)
            .field("event", &self.event)
            .finish()
    }
}
