//! Realtime channel core for the Helix client.
//!
//! A persistent, reconnecting event channel to the Helix backend, plus the two
//! client-side stores it reconciles: an append-only conversation log and a
//! last-writer-wins workspace snapshot.
//!
//! - [`ChannelConnection`] owns the link, the state machine and reconnection.
//! - [`EventRouter`] delivers typed inbound events, one handler per event.
//! - [`ConversationStore`] and [`WorkspaceStore`] hold client state.
//! - [`OutboundGateway`] sends user messages.
//! - [`HelixSession`] wires them together for the life of the application.

pub mod auth;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;
pub mod workspace;

pub use auth::{StaticToken, TokenProvider};
pub use backoff::ReconnectPolicy;
pub use config::{ChannelConfig, FileConfig, load_config};
pub use connection::{ChannelConnection, ChannelEvent, ConnectionState, Emitter};
pub use conversation::{ConversationStore, Identities};
pub use diagnostics::{Diagnostic, DiagnosticSink, RecordingSink, TracingSink};
pub use error::{ChannelError, ConfigError, PayloadError, TransportError};
pub use gateway::{OutboundGateway, OutboundPolicy, SendOutcome};
pub use protocol::{ChatTurn, EventKind, Frame, InboundEvent, Task, WorkspaceSnapshot};
pub use router::{Dispatch, EventRouter, Subscription};
pub use session::{HelixSession, StoreBindings};
pub use transport::{
    ConnectOptions, Endpoint, MemoryPeer, MemoryServer, MemoryTransport, NetworkTransport,
    Transport, TransportLink, TransportStrategy,
};
pub use workspace::WorkspaceStore;
