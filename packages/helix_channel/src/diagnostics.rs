//! Observability collaborator.
//!
//! The core never logs decisions it cannot act on directly into the caller's
//! control flow; it reports them here instead. The default sink forwards to
//! `tracing`, tests use [`RecordingSink`].

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::error::{PayloadError, TransportError};

/// A diagnostic the core wants someone to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An inbound event failed shape validation and was dropped.
    MalformedPayload { error: PayloadError },
    /// The server sent a frame using a name reserved for lifecycle events.
    ReservedEvent { event: String },
    /// A transport-level failure; recovery is the reconnection policy's job.
    Transport { error: TransportError },
    /// ChannelConnection moved between states.
    Transition {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A user message was not emitted.
    OutboundDropped { event: String, reason: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload { error } => write!(f, "dropped inbound event: {}", error),
            Self::ReservedEvent { event } => {
                write!(f, "dropped server frame with reserved name {:?}", event)
            }
            Self::Transport { error } => write!(f, "transport error: {}", error),
            Self::Transition { from, to } => write!(f, "connection {} -> {}", from, to),
            Self::OutboundDropped { event, reason } => {
                write!(f, "dropped outbound {}: {}", event, reason)
            }
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::MalformedPayload { error } => {
                warn!(event = %error.event(), code = error.error_code(), "{}", diagnostic)
            }
            Diagnostic::ReservedEvent { event } => warn!(event = %event, "{}", diagnostic),
            Diagnostic::Transport { error } => {
                warn!(code = error.error_code(), "{}", diagnostic)
            }
            Diagnostic::Transition { from, to } => {
                info!(from = %from, to = %to, "connection state changed")
            }
            Diagnostic::OutboundDropped { .. } => debug!("{}", diagnostic),
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.entries()
            .into_iter()
            .filter_map(|d| match d {
                Diagnostic::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn malformed(&self) -> Vec<PayloadError> {
        self.entries()
            .into_iter()
            .filter_map(|d| match d {
                Diagnostic::MalformedPayload { error } => Some(error),
                _ => None,
            })
            .collect()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}
