//! Error taxonomy for the channel core.
//!
//! Nothing in here is process-fatal: transport errors feed the reconnection
//! policy, payload errors are dropped after a diagnostic, and user action
//! errors are only surfaced when the caller asks for them.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Failures below the event layer: dialing, handshakes, link loss.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by server")]
    Closed,

    #[error("authentication token unavailable: {0}")]
    Auth(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("no transport strategy configured")]
    NoStrategy,
}

impl TransportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connect(_) => "connect_failed",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
            Self::Auth(_) => "auth_unavailable",
            Self::Malformed(_) => "malformed_frame",
            Self::NoStrategy => "no_strategy",
        }
    }

    /// A malformed frame is reported and skipped; everything else ends the link.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Closed
            }
            other => Self::Connect(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}

/// An inbound event whose payload does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{event} payload is missing")]
    Missing { event: String },

    #[error("{event} payload must be a JSON object")]
    NotAnObject { event: String },

    #[error("{event} payload must be a string")]
    NotAString { event: String },

    #[error("invalid {event} payload: {reason}")]
    Invalid { event: String, reason: String },
}

impl PayloadError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Missing { .. } => "payload_missing",
            Self::NotAnObject { .. } => "payload_not_object",
            Self::NotAString { .. } => "payload_not_string",
            Self::Invalid { .. } => "payload_invalid",
        }
    }

    pub fn event(&self) -> &str {
        match self {
            Self::Missing { event }
            | Self::NotAnObject { event }
            | Self::NotAString { event }
            | Self::Invalid { event, .. } => event,
        }
    }
}

/// Top-level error for callers that want a single type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// A user message could not be emitted and the outbound policy dropped it.
    #[error("not connected; message was not sent")]
    NotConnected,

    #[error("channel has been shut down")]
    Shutdown,
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::Payload(e) => e.error_code(),
            Self::NotConnected => "not_connected",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Configuration that loaded but cannot drive a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("reconnection.initial_delay_ms must be greater than zero")]
    ZeroInitialDelay,

    #[error("reconnection.max_delay_ms ({max_ms}) is below initial_delay_ms ({initial_ms})")]
    MaxBelowInitial { initial_ms: u64, max_ms: u64 },

    #[error("outbound.buffer_capacity must be greater than zero when policy is buffer")]
    ZeroBufferCapacity,

    #[error("at least one transport must be configured")]
    NoTransports,

    #[error("idle_timeout_ms ({idle_ms}) must exceed a non-zero ping_interval_ms ({ping_ms})")]
    IdleTimeoutTooShort { ping_ms: u64, idle_ms: u64 },

    #[error("failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidEndpoint { .. } => "invalid_endpoint",
            Self::ZeroInitialDelay => "zero_initial_delay",
            Self::MaxBelowInitial { .. } => "max_below_initial",
            Self::ZeroBufferCapacity => "zero_buffer_capacity",
            Self::NoTransports => "no_transports",
            Self::IdleTimeoutTooShort { .. } => "idle_timeout_too_short",
            Self::Load(_) => "config_load",
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(err.to_string())
    }
}
