//! Application-scope owner.
//!
//! `HelixSession` builds the router, the stores, the connection actor and the
//! outbound gateway from injected collaborators and keeps them alive for the
//! life of the application. Views come and go; they bind the stores through
//! [`HelixSession::bind_stores`] and release the bindings by dropping them.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::config::ChannelConfig;
use crate::connection::{ChannelConnection, ChannelEvent, ConnectionState};
use crate::conversation::ConversationStore;
use crate::diagnostics::DiagnosticSink;
use crate::gateway::{OutboundGateway, SendOutcome};
use crate::protocol::{EventKind, InboundEvent};
use crate::router::{EventRouter, Subscription};
use crate::transport::Transport;
use crate::workspace::WorkspaceStore;

pub struct HelixSession {
    config: ChannelConfig,
    router: EventRouter,
    conversation: ConversationStore,
    workspace: WorkspaceStore,
    connection: ChannelConnection,
    gateway: OutboundGateway,
}

impl HelixSession {
    /// Must be called inside a tokio runtime; spawns the connection actor.
    pub fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let router = EventRouter::new(diagnostics.clone());
        let conversation = ConversationStore::new(config.identities.clone());
        let workspace = WorkspaceStore::new();
        let connection = ChannelConnection::spawn(transport, router.clone(), diagnostics);
        let gateway = OutboundGateway::new(conversation.clone(), connection.emitter(), config.outbound)
            .with_event(config.outbound_event.clone());

        Self {
            config,
            router,
            conversation,
            workspace,
            connection,
            gateway,
        }
    }

    /// Connect to the configured endpoint. No-op while already active.
    pub fn connect(&self) {
        self.connection
            .connect(self.config.endpoint.clone(), self.config.connect.clone());
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Route assistant replies and workspace snapshots into the stores.
    ///
    /// Binding again replaces the previous bindings, so a remounted view never
    /// causes duplicate appends.
    #[must_use = "dropping the bindings unregisters the store handlers"]
    pub fn bind_stores(&self) -> StoreBindings {
        let conversation = self.conversation.clone();
        let assistant = self.router.on(EventKind::AssistantReply, move |event| {
            if let InboundEvent::AssistantReply(text) = event {
                conversation.append_remote(text.as_str());
            }
        });

        let workspace = self.workspace.clone();
        let snapshots = self.router.on(EventKind::WorkspaceUpdate, move |event| {
            if let InboundEvent::WorkspaceUpdate(snapshot) = event {
                workspace.replace(snapshot.clone());
            }
        });

        let connect = self.router.on(EventKind::Connect, |_| {
            info!("channel connected");
        });
        let disconnect = self.router.on(EventKind::Disconnect, |_| {
            info!("channel disconnected");
        });

        StoreBindings {
            subscriptions: vec![assistant, snapshots, connect, disconnect],
        }
    }

    /// Drop every handler, bound or not.
    pub fn unbind_stores(&self) {
        self.router.clear();
    }

    pub async fn send(&self, text: impl Into<String>) -> SendOutcome {
        self.gateway.send(text).await
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn conversation(&self) -> &ConversationStore {
        &self.conversation
    }

    pub fn workspace(&self) -> &WorkspaceStore {
        &self.workspace
    }

    pub fn gateway(&self) -> &OutboundGateway {
        &self.gateway
    }

    pub fn connection(&self) -> &ChannelConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_watch()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.connection.subscribe()
    }

    /// Disconnect, release every handler and stop the actor.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.router.clear();
        self.connection.shutdown();
        info!("session shut down");
    }
}

impl std::fmt::Debug for HelixSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelixSession")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .field("router", &self.router)
            .finish()
    }
}

/// Store handlers registered by [`HelixSession::bind_stores`].
#[derive(Debug)]
pub struct StoreBindings {
    subscriptions: Vec<Subscription>,
}

impl StoreBindings {
    /// Whether these bindings are still the ones receiving events.
    pub fn is_active(&self) -> bool {
        self.subscriptions.iter().all(Subscription::is_active)
    }
}
