use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{StaticToken, TokenProvider};
use crate::backoff::ReconnectPolicy;
use crate::conversation::{DEFAULT_ASSISTANT_IDENTITY, DEFAULT_LOCAL_IDENTITY, Identities};
use crate::error::ConfigError;
use crate::gateway::{DEFAULT_BUFFER_CAPACITY, OutboundPolicy};
use crate::protocol::USER_MESSAGE;
use crate::transport::{ConnectOptions, Endpoint, TransportStrategy};

// =============================================================================
// File config (figment-deserialized from defaults / helix.toml / env vars)
// =============================================================================
//
//   helix.toml:      [reconnection]
//                    max_delay_ms = 8000
//
//   env var:         HELIX_RECONNECTION__MAX_DELAY_MS=8000   (double underscore = nesting)

pub const DEFAULT_ENDPOINT: &str = "http://localhost:5000";
pub const DEFAULT_CONFIG_FILE: &str = "helix.toml";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportStrategy>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Silence on an open link for this long counts as link loss.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub reconnection: ReconnectionFileConfig,
    #[serde(default)]
    pub outbound: OutboundFileConfig,
    #[serde(default)]
    pub identity: IdentityFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transports: default_transports(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reconnection: Default::default(),
            outbound: Default::default(),
            identity: Default::default(),
            auth: Default::default(),
        }
    }
}

/// Backoff tunables (lives under `[reconnection]` in helix.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectionFileConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Absent retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectionFileConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundPolicyName {
    #[default]
    Drop,
    Buffer,
}

/// User message tunables (lives under `[outbound]` in helix.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundFileConfig {
    #[serde(default)]
    pub policy: OutboundPolicyName,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Event name user messages are emitted under.
    #[serde(default = "default_outbound_event")]
    pub event: String,
}

impl Default for OutboundFileConfig {
    fn default() -> Self {
        Self {
            policy: OutboundPolicyName::Drop,
            buffer_capacity: default_buffer_capacity(),
            event: default_outbound_event(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityFileConfig {
    #[serde(default = "default_local_identity")]
    pub local: String,
    #[serde(default = "default_assistant_identity")]
    pub assistant: String,
}

impl Default for IdentityFileConfig {
    fn default() -> Self {
        Self {
            local: default_local_identity(),
            assistant: default_assistant_identity(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub token: Option<String>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_transports() -> Vec<TransportStrategy> {
    vec![TransportStrategy::WebSocket, TransportStrategy::Polling]
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_ping_interval_ms() -> u64 {
    25_000
}
fn default_idle_timeout_ms() -> u64 {
    45_000
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}
fn default_outbound_event() -> String {
    USER_MESSAGE.to_string()
}
fn default_local_identity() -> String {
    DEFAULT_LOCAL_IDENTITY.to_string()
}
fn default_assistant_identity() -> String {
    DEFAULT_ASSISTANT_IDENTITY.to_string()
}

/// Build a figment that layers: defaults → helix.toml (when given) → HELIX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HELIX_ENDPOINT=https://helix.example`  →  `endpoint = "https://helix.example"`
///   `HELIX_OUTBOUND__POLICY=buffer`  →  `outbound.policy = "buffer"`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("HELIX_").split("__"))
}

// =============================================================================
// Runtime config (validated from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    pub connect: ConnectOptions,
    pub outbound: OutboundPolicy,
    pub outbound_event: String,
    pub identities: Identities,
}

impl ChannelConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::parse(&fc.endpoint)?;

        let reconnection = &fc.reconnection;
        if reconnection.initial_delay_ms == 0 {
            return Err(ConfigError::ZeroInitialDelay);
        }
        if reconnection.max_delay_ms < reconnection.initial_delay_ms {
            return Err(ConfigError::MaxBelowInitial {
                initial_ms: reconnection.initial_delay_ms,
                max_ms: reconnection.max_delay_ms,
            });
        }
        if fc.transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        if fc.ping_interval_ms == 0 || fc.idle_timeout_ms <= fc.ping_interval_ms {
            return Err(ConfigError::IdleTimeoutTooShort {
                ping_ms: fc.ping_interval_ms,
                idle_ms: fc.idle_timeout_ms,
            });
        }

        let outbound = match fc.outbound.policy {
            OutboundPolicyName::Drop => OutboundPolicy::Drop,
            OutboundPolicyName::Buffer if fc.outbound.buffer_capacity == 0 => {
                return Err(ConfigError::ZeroBufferCapacity);
            }
            OutboundPolicyName::Buffer => OutboundPolicy::Buffer {
                capacity: fc.outbound.buffer_capacity,
            },
        };

        let connect = ConnectOptions {
            transports: fc.transports.clone(),
            timeout: Duration::from_millis(fc.connect_timeout_ms),
            ping_interval: Duration::from_millis(fc.ping_interval_ms),
            idle_timeout: Duration::from_millis(fc.idle_timeout_ms),
            reconnection: ReconnectPolicy::new(
                Duration::from_millis(reconnection.initial_delay_ms),
                Duration::from_millis(reconnection.max_delay_ms),
            )
            .with_max_attempts(reconnection.max_attempts),
            auth: fc
                .auth
                .token
                .as_ref()
                .map(|token| Arc::new(StaticToken::new(token.clone())) as Arc<dyn TokenProvider>),
            ..Default::default()
        };

        Ok(Self {
            endpoint,
            connect,
            outbound,
            outbound_event: fc.outbound.event.clone(),
            identities: Identities {
                local: fc.identity.local.clone(),
                assistant: fc.identity.assistant.clone(),
            },
        })
    }

    /// Load and validate in one go.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let fc: FileConfig = load_config(path).extract()?;
        Self::from_file(&fc)
    }
}
