//! Wire protocol types.
//!
//! Every frame on the wire is a JSON object `{"event": <name>, "data": <payload>}`.
//! Event names are open-ended on the wire; only the names in [`EventKind`] are
//! routed, everything else is ignored for forward compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const ASSISTANT_REPLY: &str = "assistant-reply";
pub const WORKSPACE_UPDATE: &str = "workspace-update";
pub const USER_MESSAGE: &str = "user-message";

/// Legacy names older servers emit for the same events.
const ASSISTANT_REPLY_ALIAS: &str = "ai_response";
const WORKSPACE_UPDATE_ALIAS: &str = "workspace_update";

/// A single named event as it travels over a transport link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            event: event.into(),
            data: Some(data.into()),
        }
    }

    /// A frame with no payload.
    pub fn bare(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The inbound events the router knows how to type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    AssistantReply,
    WorkspaceUpdate,
}

impl EventKind {
    /// Classify a wire name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            CONNECT => Some(Self::Connect),
            DISCONNECT => Some(Self::Disconnect),
            ASSISTANT_REPLY | ASSISTANT_REPLY_ALIAS => Some(Self::AssistantReply),
            WORKSPACE_UPDATE | WORKSPACE_UPDATE_ALIAS => Some(Self::WorkspaceUpdate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => CONNECT,
            Self::Disconnect => DISCONNECT,
            Self::AssistantReply => ASSISTANT_REPLY,
            Self::WorkspaceUpdate => WORKSPACE_UPDATE,
        }
    }

    /// Lifecycle events are produced by the connection itself, never by the server.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, Self::Connect | Self::Disconnect)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A task in the workspace list. Identity is `id`; uniqueness is the server's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub description: String,
}

impl Task {
    pub fn new(id: i64, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }
}

/// The complete task list as last pushed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub tasks: Vec<Task>,
}

impl WorkspaceSnapshot {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// One line of conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub sender: String,
    pub text: String,
}

impl ChatTurn {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Workspace payload as sent by the server. `tasks` may be absent or null.
#[derive(Debug, Deserialize)]
struct WorkspacePayload {
    #[serde(default)]
    tasks: Option<Vec<Task>>,
}

/// A validated, typed inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connect,
    Disconnect,
    AssistantReply(String),
    WorkspaceUpdate(WorkspaceSnapshot),
}

impl InboundEvent {
    /// Validate a raw payload against the shape expected for `kind`.
    pub fn decode(kind: EventKind, payload: Option<&Value>) -> Result<Self, PayloadError> {
        let event = || kind.name().to_string();
        match kind {
            EventKind::Connect => Ok(Self::Connect),
            EventKind::Disconnect => Ok(Self::Disconnect),
            EventKind::AssistantReply => match payload {
                Some(Value::String(text)) => Ok(Self::AssistantReply(text.clone())),
                Some(_) => Err(PayloadError::NotAString { event: event() }),
                None => Err(PayloadError::Missing { event: event() }),
            },
            EventKind::WorkspaceUpdate => {
                let value = payload.ok_or_else(|| PayloadError::Missing { event: event() })?;
                if !value.is_object() {
                    return Err(PayloadError::NotAnObject { event: event() });
                }
                let parsed = WorkspacePayload::deserialize(value).map_err(|e| {
                    PayloadError::Invalid {
                        event: event(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::WorkspaceUpdate(WorkspaceSnapshot::new(
                    parsed.tasks.unwrap_or_default(),
                )))
            }
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Disconnect => EventKind::Disconnect,
            Self::AssistantReply(_) => EventKind::AssistantReply,
            Self::WorkspaceUpdate(_) => EventKind::WorkspaceUpdate,
        }
    }
}
