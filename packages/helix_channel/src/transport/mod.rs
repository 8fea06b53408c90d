//! Transport layer.
//!
//! Submodules:
//! - `websocket`: streaming socket strategy over tokio-tungstenite
//! - `polling`: HTTP long-polling strategy over reqwest
//! - `memory`: in-process transport for tests and offline use
//!
//! A transport turns an [`Endpoint`] into a [`TransportLink`]: a pair of frame
//! channels backed by pump tasks. The link is owned by exactly one
//! `ChannelConnection`; dropping it cancels the pumps.

pub mod memory;
mod polling;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::TokenProvider;
use crate::backoff::ReconnectPolicy;
use crate::error::{ConfigError, TransportError};
use crate::protocol::Frame;

pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};

/// Response header a server may use to name the session.
pub const SESSION_HEADER: &str = "x-session-id";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_LINK_CAPACITY: usize = 100;

/// How a link is carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    #[default]
    WebSocket,
    Polling,
}

impl std::fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::Polling => f.write_str("polling"),
        }
    }
}

/// Server base address. Strategy URLs are derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
}

impl Endpoint {
    /// Accepts `http`, `https`, `ws` and `wss` base URLs.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            endpoint: input.to_string(),
            reason,
        };
        let base = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        match base.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => return Err(invalid(format!("unsupported scheme {:?}", other))),
        }
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }
        Ok(Self { base })
    }

    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }

    fn secure(&self) -> bool {
        matches!(self.base.scheme(), "https" | "wss")
    }

    fn with_scheme_and_path(&self, scheme: &str, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.set_scheme(scheme)
            .map_err(|()| TransportError::Connect(format!("cannot use scheme {}", scheme)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| TransportError::Connect(format!("{} is not a base URL", self.base)))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// `ws(s)://host/.../ws`
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let scheme = if self.secure() { "wss" } else { "ws" };
        self.with_scheme_and_path(scheme, &["ws"])
    }

    /// `http(s)://host/.../poll`
    pub fn polling_url(&self) -> Result<Url, TransportError> {
        let scheme = if self.secure() { "https" } else { "http" };
        self.with_scheme_and_path(scheme, &["poll"])
    }

    /// `http(s)://host/.../poll/handshake`
    pub fn polling_handshake_url(&self) -> Result<Url, TransportError> {
        let scheme = if self.secure() { "https" } else { "http" };
        self.with_scheme_and_path(scheme, &["poll", "handshake"])
    }

    /// `http(s)://host/.../<segments>`, for request/reply collaborators.
    pub fn http_url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let scheme = if self.secure() { "https" } else { "http" };
        self.with_scheme_and_path(scheme, segments)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base.as_str())
    }
}

/// Options for `ChannelConnection::connect`.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Strategies tried in order on every dial.
    pub transports: Vec<TransportStrategy>,
    /// Per-strategy dial timeout.
    pub timeout: Duration,
    pub reconnection: ReconnectPolicy,
    pub auth: Option<Arc<dyn TokenProvider>>,
    /// Frames buffered per direction inside a link.
    pub link_capacity: usize,
    /// How often an open websocket is pinged.
    pub ping_interval: Duration,
    /// An open link that hears nothing for this long is lost. Also bounds
    /// each long-poll request.
    pub idle_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            transports: vec![TransportStrategy::WebSocket, TransportStrategy::Polling],
            timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnection: ReconnectPolicy::default(),
            auth: None,
            link_capacity: DEFAULT_LINK_CAPACITY,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("transports", &self.transports)
            .field("timeout", &self.timeout)
            .field("reconnection", &self.reconnection)
            .field("auth", &self.auth.as_ref().map(|_| ".."))
            .field("link_capacity", &self.link_capacity)
            .field("ping_interval", &self.ping_interval)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// An open connection to the server.
pub struct TransportLink {
    session_id: String,
    strategy: TransportStrategy,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
    cancel: CancellationToken,
}

impl TransportLink {
    pub fn new(
        session_id: String,
        strategy: TransportStrategy,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Result<Frame, TransportError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            strategy,
            outbound,
            inbound,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn strategy(&self) -> TransportStrategy {
        self.strategy
    }

    /// Queue a frame for the writer pump without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.outbound.try_send(frame)
    }

    /// Next inbound item. `None` means the pumps are gone.
    pub async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait Transport: Send + Sync {
    fn open(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

/// The real network: websocket and long-polling, tried in the order the
/// options list them.
#[derive(Debug, Clone, Default)]
pub struct NetworkTransport {
    client: reqwest::Client,
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for NetworkTransport {
    fn open(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let endpoint = endpoint.clone();
        let options = options.clone();
        let client = self.client.clone();

        Box::pin(async move {
            let token = match &options.auth {
                Some(provider) => provider.token().await?,
                None => None,
            };

            let mut last_error = TransportError::NoStrategy;
            for strategy in &options.transports {
                let attempt = match strategy {
                    TransportStrategy::WebSocket => {
                        tokio::time::timeout(
                            options.timeout,
                            websocket::open(&endpoint, token.as_deref(), &options),
                        )
                        .await
                    }
                    TransportStrategy::Polling => {
                        tokio::time::timeout(
                            options.timeout,
                            polling::open(&client, &endpoint, token.clone(), &options),
                        )
                        .await
                    }
                };

                match attempt {
                    Ok(Ok(link)) => {
                        info!(
                            endpoint = %endpoint,
                            strategy = %strategy,
                            session_id = %link.session_id(),
                            "transport link open"
                        );
                        return Ok(link);
                    }
                    Ok(Err(e)) => {
                        debug!(strategy = %strategy, error = %e, "transport strategy failed");
                        last_error = e;
                    }
                    Err(_) => {
                        debug!(strategy = %strategy, "transport strategy timed out");
                        last_error = TransportError::Timeout(options.timeout);
                    }
                }
            }
            Err(last_error)
        })
    }
}
