//! In-process transport.
//!
//! Every accepted dial hands a [`MemoryPeer`] to the paired [`MemoryServer`], so
//! a test can push frames at the client, read what it emits, and kill the link.
//! Dials can be scripted to fail, and the instant of every dial is recorded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectOptions, Endpoint, Transport, TransportLink};
use crate::error::TransportError;
use crate::protocol::Frame;

#[derive(Debug, Default)]
struct DialState {
    dials: Vec<Instant>,
    /// Scripted outcomes for the next dials; `true` refuses.
    script: VecDeque<bool>,
    refuse_all: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DialState>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, DialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Server side: yields one peer per accepted dial.
#[derive(Debug)]
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DialState::default()),
                peers: peers_tx,
            }),
        };
        (transport, MemoryServer { peers: peers_rx })
    }

    /// Refuse the next `n` dials, then go back to the default behaviour.
    pub fn refuse_next(&self, n: usize) {
        let mut state = self.shared.state();
        state.script.extend(std::iter::repeat_n(true, n));
    }

    /// Refuse every dial until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.shared.state().refuse_all = refuse;
    }

    pub fn dial_count(&self) -> usize {
        self.shared.state().dials.len()
    }

    pub fn dial_instants(&self) -> Vec<Instant> {
        self.shared.state().dials.clone()
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        _endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let shared = self.shared.clone();
        let capacity = options.link_capacity.max(1);
        let strategy = options.transports.first().copied().unwrap_or_default();

        Box::pin(async move {
            let (refused, dial_number) = {
                let mut state = shared.state();
                state.dials.push(Instant::now());
                let scripted = state.script.pop_front().unwrap_or(false);
                (state.refuse_all || scripted, state.dials.len())
            };
            if refused {
                return Err(TransportError::Connect("connection refused".to_string()));
            }

            let session_id = format!("mem-{}", dial_number);
            let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
            let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
            let cancel = CancellationToken::new();

            let peer = MemoryPeer {
                session_id: session_id.clone(),
                inbound: inbound_tx,
                outbound: outbound_rx,
                cancel: cancel.clone(),
            };
            // No server listening is the same as a server that accepts and ignores.
            let _ = shared.peers.send(peer);

            Ok(TransportLink::new(
                session_id,
                strategy,
                outbound_tx,
                inbound_rx,
                cancel,
            ))
        })
    }
}

impl MemoryServer {
    /// Wait for the next accepted dial.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Server end of one accepted link.
#[derive(Debug)]
pub struct MemoryPeer {
    session_id: String,
    inbound: mpsc::Sender<Result<Frame, TransportError>>,
    outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
}

impl MemoryPeer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver a frame to the client. Returns false once the client dropped the link.
    pub async fn push(&self, frame: Frame) -> bool {
        self.inbound.send(Ok(frame)).await.is_ok()
    }

    pub async fn emit(&self, event: &str, data: Value) -> bool {
        self.push(Frame::new(event, data)).await
    }

    /// Deliver a transport error (fatal errors end the link on the client side).
    pub async fn fail(&self, error: TransportError) -> bool {
        self.inbound.send(Err(error)).await.is_ok()
    }

    /// Next frame the client emitted, or `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Whether the client has torn the link down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Server-side hang up.
    pub fn close(self) {
        drop(self);
    }
}
