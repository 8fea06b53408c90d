//! ChannelConnection: the reconnecting link to the server.
//!
//! A single actor task owns the transport link, the state machine and the
//! retry timer. Commands from the handle (connect, disconnect, emit) and frames
//! from the link are processed one at a time on that task, so dispatch order
//! is the order the transport delivered frames in.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!                               |                    |
//!                          dial failed          link lost
//!                               v                    v
//!                         Reconnecting <-------------+
//!                               | retry due: dial again (stays Reconnecting)
//!                               | max attempts exhausted: Failed
//! any --disconnect--> Disconnected (pending retry cancelled)
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::TransportError;
use crate::gateway::{OutboundPolicy, SendOutcome};
use crate::protocol::{CONNECT, DISCONNECT, EventKind, Frame};
use crate::router::EventRouter;
use crate::transport::{ConnectOptions, Endpoint, Transport, TransportLink, TransportStrategy};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted under a bounded `max_attempts` policy.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Notifications for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    StateChanged(ConnectionState),
    /// A link is open and the connect handler has run.
    Ready {
        session_id: String,
        strategy: TransportStrategy,
    },
}

enum Command {
    Connect {
        endpoint: Endpoint,
        options: ConnectOptions,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Emit {
        frame: Frame,
        policy: OutboundPolicy,
        reply: oneshot::Sender<SendOutcome>,
    },
}

/// Handle to the connection actor. Dropping it stops the actor.
pub struct ChannelConnection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: CancellationToken,
}

impl ChannelConnection {
    /// Spawn the actor on the current tokio runtime. Starts `Disconnected`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        router: EventRouter,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let actor = ConnectionActor {
            transport,
            router,
            diagnostics,
            commands: commands_rx,
            state: state_tx,
            events: events_tx.clone(),
            shutdown: shutdown.clone(),
            target: None,
            attempts: 0,
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            shutdown,
        }
    }

    /// Start connecting. A no-op unless the connection is idle
    /// (`Disconnected` or `Failed`).
    pub fn connect(&self, endpoint: Endpoint, options: ConnectOptions) {
        if self
            .commands
            .send(Command::Connect { endpoint, options })
            .is_err()
        {
            debug!("connect after shutdown ignored");
        }
    }

    /// Tear down the link and cancel any pending retry. Idempotent.
    /// Returns once the actor has processed the teardown.
    pub async fn disconnect(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Egress handle for the outbound gateway.
    pub fn emitter(&self) -> Emitter {
        Emitter {
            commands: self.commands.clone(),
        }
    }

    /// Stop the actor. The state ends at `Disconnected`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("state", &self.state())
            .finish()
    }
}

/// Sends frames through the connection actor.
#[derive(Clone)]
pub struct Emitter {
    commands: mpsc::UnboundedSender<Command>,
}

impl Emitter {
    pub async fn emit(&self, frame: Frame, policy: OutboundPolicy) -> SendOutcome {
        let (reply, outcome) = oneshot::channel();
        let command = Command::Emit {
            frame,
            policy,
            reply,
        };
        if self.commands.send(command).is_err() {
            return SendOutcome::Dropped;
        }
        outcome.await.unwrap_or(SendOutcome::Dropped)
    }
}

struct Target {
    endpoint: Endpoint,
    options: ConnectOptions,
}

enum Phase {
    /// `Disconnected` or `Failed`.
    Idle,
    Dialing(BoxFuture<'static, Result<TransportLink, TransportError>>),
    Live(TransportLink),
    Waiting(Pin<Box<Sleep>>),
}

enum Step {
    Command(Command),
    Dialed(Result<TransportLink, TransportError>),
    Inbound(Option<Result<Frame, TransportError>>),
    RetryDue,
}

struct ConnectionActor {
    transport: Arc<dyn Transport>,
    router: EventRouter,
    diagnostics: Arc<dyn DiagnosticSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: CancellationToken,
    target: Option<Target>,
    /// Retries scheduled since the last successful open.
    attempts: u32,
    /// Frames held back under `OutboundPolicy::Buffer`, oldest first.
    pending: VecDeque<Frame>,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => break,
                },
                step = progress(&mut phase) => step,
            };

            phase = match step {
                Step::Command(cmd) => self.on_command(cmd, phase),
                Step::Dialed(Ok(link)) => self.on_open(link),
                Step::Dialed(Err(error)) => self.on_dial_failed(error),
                Step::Inbound(item) => self.on_inbound(item, phase),
                Step::RetryDue => {
                    debug!(attempt = self.attempts, "reconnection attempt");
                    self.dial()
                }
            };
        }

        drop(phase);
        self.pending.clear();
        self.transition(ConnectionState::Disconnected);
        debug!("connection actor stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.current();
        if from == to {
            return;
        }
        self.state.send_replace(to);
        self.diagnostics
            .report(Diagnostic::Transition { from, to });
        let _ = self.events.send(ChannelEvent::StateChanged(to));
    }

    fn on_command(&mut self, cmd: Command, phase: Phase) -> Phase {
        match cmd {
            Command::Connect { endpoint, options } => {
                if !matches!(phase, Phase::Idle) {
                    debug!(state = %self.current(), "connect ignored, already active");
                    return phase;
                }
                info!(endpoint = %endpoint, "connecting");
                self.target = Some(Target { endpoint, options });
                self.attempts = 0;
                self.transition(ConnectionState::Connecting);
                self.dial()
            }
            Command::Disconnect { done } => {
                let was_live = matches!(phase, Phase::Live(_));
                // Dropping the phase closes the link or cancels the retry timer.
                drop(phase);
                self.target = None;
                self.attempts = 0;
                if !self.pending.is_empty() {
                    debug!(discarded = self.pending.len(), "discarding buffered messages");
                    self.pending.clear();
                }
                self.transition(ConnectionState::Disconnected);
                if was_live {
                    self.router.dispatch(DISCONNECT, None);
                }
                let _ = done.send(());
                Phase::Idle
            }
            Command::Emit {
                frame,
                policy,
                reply,
            } => {
                let outcome = self.emit(frame, policy, &phase);
                let _ = reply.send(outcome);
                phase
            }
        }
    }

    fn dial(&mut self) -> Phase {
        match &self.target {
            Some(target) => Phase::Dialing(self.transport.open(&target.endpoint, &target.options)),
            None => Phase::Idle,
        }
    }

    fn on_open(&mut self, link: TransportLink) -> Phase {
        self.attempts = 0;
        let session_id = link.session_id().to_string();
        info!(session_id = %session_id, strategy = %link.strategy(), "connected to server");

        self.transition(ConnectionState::Connected);
        let _ = self.events.send(ChannelEvent::Ready {
            session_id,
            strategy: link.strategy(),
        });
        self.router.dispatch(CONNECT, None);
        self.flush(&link);
        Phase::Live(link)
    }

    fn on_dial_failed(&mut self, error: TransportError) -> Phase {
        warn!(error = %error, "connection attempt failed");
        self.diagnostics.report(Diagnostic::Transport { error });
        self.schedule_retry()
    }

    fn on_inbound(&mut self, item: Option<Result<Frame, TransportError>>, phase: Phase) -> Phase {
        let Phase::Live(link) = phase else {
            return phase;
        };
        match item {
            Some(Ok(frame)) => {
                self.on_frame(frame);
                Phase::Live(link)
            }
            Some(Err(error)) if !error.is_fatal() => {
                self.diagnostics.report(Diagnostic::Transport { error });
                Phase::Live(link)
            }
            Some(Err(error)) => self.on_lost(link, error),
            None => self.on_lost(link, TransportError::Closed),
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if EventKind::from_name(&frame.event).is_some_and(EventKind::is_lifecycle) {
            self.diagnostics
                .report(Diagnostic::ReservedEvent { event: frame.event });
            return;
        }
        self.router.dispatch(&frame.event, frame.data.as_ref());
    }

    fn on_lost(&mut self, link: TransportLink, error: TransportError) -> Phase {
        info!(session_id = %link.session_id(), error = %error, "disconnected from server");
        drop(link);
        self.diagnostics.report(Diagnostic::Transport { error });
        let next = self.schedule_retry();
        self.router.dispatch(DISCONNECT, None);
        next
    }

    fn schedule_retry(&mut self) -> Phase {
        let Some(target) = &self.target else {
            self.transition(ConnectionState::Disconnected);
            return Phase::Idle;
        };
        let policy = target.options.reconnection;
        if !policy.allows(self.attempts) {
            warn!(attempts = self.attempts, "giving up on reconnection");
            self.transition(ConnectionState::Failed);
            return Phase::Idle;
        }

        let delay = policy.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.transition(ConnectionState::Reconnecting);
        debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Phase::Waiting(Box::pin(tokio::time::sleep(delay)))
    }

    fn emit(&mut self, frame: Frame, policy: OutboundPolicy, phase: &Phase) -> SendOutcome {
        let Phase::Live(link) = phase else {
            return self.hold(frame, policy, "not connected");
        };
        // Older buffered frames go first.
        if !self.pending.is_empty() {
            let outcome = self.hold(frame, policy, "outbound backlog");
            self.flush(link);
            return if outcome == SendOutcome::Buffered && self.pending.is_empty() {
                SendOutcome::Emitted
            } else {
                outcome
            };
        }
        match link.try_send(frame) {
            Ok(()) => SendOutcome::Emitted,
            Err(TrySendError::Full(frame)) => self.hold(frame, policy, "link backlog full"),
            Err(TrySendError::Closed(frame)) => self.hold(frame, policy, "link closing"),
        }
    }

    fn hold(&mut self, frame: Frame, policy: OutboundPolicy, reason: &str) -> SendOutcome {
        let reason = match policy {
            OutboundPolicy::Buffer { capacity } if self.pending.len() < capacity => {
                self.pending.push_back(frame);
                return SendOutcome::Buffered;
            }
            OutboundPolicy::Buffer { capacity } => {
                format!("{}; outbound buffer full ({})", reason, capacity)
            }
            OutboundPolicy::Drop => reason.to_string(),
        };
        self.diagnostics.report(Diagnostic::OutboundDropped {
            event: frame.event,
            reason,
        });
        SendOutcome::Dropped
    }

    fn flush(&mut self, link: &TransportLink) {
        let mut flushed = 0usize;
        while let Some(frame) = self.pending.pop_front() {
            match link.try_send(frame) {
                Ok(()) => flushed += 1,
                Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => {
                    self.pending.push_front(frame);
                    break;
                }
            }
        }
        if flushed > 0 {
            debug!(flushed, remaining = self.pending.len(), "flushed buffered messages");
        }
    }
}

/// Drive whatever the current phase is waiting on.
async fn progress(phase: &mut Phase) -> Step {
    match phase {
        Phase::Idle => std::future::pending::<Step>().await,
        Phase::Dialing(dial) => Step::Dialed(dial.await),
        Phase::Live(link) => Step::Inbound(link.recv().await),
        Phase::Waiting(sleep) => {
            sleep.as_mut().await;
            Step::RetryDue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::diagnostics::RecordingSink;
    use crate::protocol::InboundEvent;
    use crate::transport::{MemoryServer, MemoryTransport};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        connection: ChannelConnection,
        transport: MemoryTransport,
        server: MemoryServer,
        router: EventRouter,
        sink: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let (transport, server) = MemoryTransport::new();
        let sink = Arc::new(RecordingSink::new());
        let router = EventRouter::new(sink.clone());
        let connection =
            ChannelConnection::spawn(Arc::new(transport.clone()), router.clone(), sink.clone());
        Harness {
            connection,
            transport,
            server,
            router,
            sink,
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::parse("http://localhost:5000").unwrap()
    }

    async fn wait_for(connection: &ChannelConnection, target: ConnectionState) {
        let mut rx = connection.state_watch();
        rx.wait_for(|s| *s == target).await.unwrap();
    }

    fn gaps(instants: &[Instant]) -> Vec<Duration> {
        instants.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn assert_close(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let mut h = harness();
        let mut events = h.connection.subscribe();

        h.connection.connect(endpoint(), ConnectOptions::default());
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        h.connection.connect(endpoint(), ConnectOptions::default());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.transport.dial_count(), 1);
        let peer = h.server.accept().await.unwrap();
        assert_eq!(h.connection.state(), ConnectionState::Connected);

        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::StateChanged(ConnectionState::Connected)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Ready {
                session_id: peer.session_id().to_string(),
                strategy: TransportStrategy::WebSocket,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_handlers_run_on_open_and_loss() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let _connect = h.router.on(EventKind::Connect, move |e| a.lock().unwrap().push(e.clone()));
        let _disconnect =
            h.router.on(EventKind::Disconnect, move |e| b.lock().unwrap().push(e.clone()));

        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        h.server.accept().await.unwrap().close();
        wait_for(&h.connection, ConnectionState::Reconnecting).await;
        wait_for(&h.connection, ConnectionState::Connected).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                InboundEvent::Connect,
                InboundEvent::Disconnect,
                InboundEvent::Connect
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_retries_after_initial_delay() {
        let mut h = harness();
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;

        let lost_at = Instant::now();
        h.server.accept().await.unwrap().close();
        wait_for(&h.connection, ConnectionState::Reconnecting).await;
        wait_for(&h.connection, ConnectionState::Connected).await;

        let instants = h.transport.dial_instants();
        assert_eq!(instants.len(), 2);
        assert_close(instants[1] - lost_at, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_to_ceiling() {
        let h = harness();
        h.transport.refuse_next(5);
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;

        let gaps = gaps(&h.transport.dial_instants());
        assert_eq!(gaps.len(), 5);
        for (gap, expected) in gaps.iter().zip([1000, 2000, 4000, 5000, 5000]) {
            assert_close(*gap, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        let mut h = harness();
        h.transport.refuse_next(3);
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;

        let lost_at = Instant::now();
        h.server.accept().await.unwrap().close();
        wait_for(&h.connection, ConnectionState::Reconnecting).await;
        wait_for(&h.connection, ConnectionState::Connected).await;

        let instants = h.transport.dial_instants();
        assert_eq!(instants.len(), 5);
        assert_close(instants[4] - lost_at, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let h = harness();
        h.transport.refuse_all(true);
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Reconnecting).await;

        h.connection.disconnect().await;
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.transport.dial_count(), 1);
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_closes_link() {
        let mut h = harness();
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        let peer = h.server.accept().await.unwrap();

        h.connection.disconnect().await;
        h.connection.disconnect().await;
        assert!(peer.is_closed());
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);

        let to_disconnected = h
            .sink
            .transitions()
            .into_iter()
            .filter(|(_, to)| *to == ConnectionState::Disconnected)
            .count();
        assert_eq!(to_disconnected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_disconnect_starts_fresh_cycle() {
        let h = harness();
        h.transport.refuse_all(true);
        h.connection.connect(endpoint(), ConnectOptions::default());
        // Dials at 0s, 1s, 3s, 7s.
        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(h.transport.dial_count(), 4);
        h.connection.disconnect().await;

        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Reconnecting).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let instants = h.transport.dial_instants();
        assert_eq!(instants.len(), 6);
        assert_close(instants[5] - instants[4], 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_ends_in_failed() {
        let h = harness();
        h.transport.refuse_all(true);
        let options = ConnectOptions {
            reconnection: ReconnectPolicy::default().with_max_attempts(Some(2)),
            ..Default::default()
        };
        h.connection.connect(endpoint(), options);
        wait_for(&h.connection, ConnectionState::Failed).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.dial_count(), 3);

        // Failed is idle: connect starts over.
        h.transport.refuse_all(false);
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        assert_eq!(h.transport.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_dispatch_in_delivery_order() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = h.router.on(EventKind::AssistantReply, move |e| {
            if let InboundEvent::AssistantReply(text) = e {
                s.lock().unwrap().push(text.clone());
            }
        });

        h.connection.connect(endpoint(), ConnectOptions::default());
        let peer = h.server.accept().await.unwrap();
        for text in ["one", "two", "three"] {
            peer.emit("assistant-reply", json!(text)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reserved_names_from_server_are_dropped() {
        let mut h = harness();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let _sub = h.router.on(EventKind::Connect, move |_| *c.lock().unwrap() += 1);

        h.connection.connect(endpoint(), ConnectOptions::default());
        let peer = h.server.accept().await.unwrap();
        peer.push(Frame::bare("connect")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(h.sink.entries().contains(&Diagnostic::ReservedEvent {
            event: "connect".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_keeps_link() {
        let mut h = harness();
        h.connection.connect(endpoint(), ConnectOptions::default());
        let peer = h.server.accept().await.unwrap();
        peer.fail(TransportError::Malformed("not json".into())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.connection.state(), ConnectionState::Connected);
        assert!(!peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn emit_policies_while_disconnected() {
        let h = harness();
        let emitter = h.connection.emitter();

        let outcome = emitter
            .emit(Frame::new("user-message", "a"), OutboundPolicy::Drop)
            .await;
        assert_eq!(outcome, SendOutcome::Dropped);

        let buffer = OutboundPolicy::Buffer { capacity: 1 };
        assert_eq!(
            emitter.emit(Frame::new("user-message", "b"), buffer).await,
            SendOutcome::Buffered
        );
        assert_eq!(
            emitter.emit(Frame::new("user-message", "c"), buffer).await,
            SendOutcome::Dropped
        );
        assert_eq!(
            h.sink
                .entries()
                .iter()
                .filter(|d| matches!(d, Diagnostic::OutboundDropped { .. }))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_frames_flush_in_order_on_connect() {
        let mut h = harness();
        let emitter = h.connection.emitter();
        let buffer = OutboundPolicy::Buffer { capacity: 8 };

        for text in ["first", "second"] {
            assert_eq!(
                emitter.emit(Frame::new("user-message", text), buffer).await,
                SendOutcome::Buffered
            );
        }
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        assert_eq!(
            emitter.emit(Frame::new("user-message", "third"), buffer).await,
            SendOutcome::Emitted
        );

        let mut peer = h.server.accept().await.unwrap();
        for expected in ["first", "second", "third"] {
            assert_eq!(
                peer.recv().await,
                Some(Frame::new("user-message", expected))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_discards_buffer() {
        let mut h = harness();
        let emitter = h.connection.emitter();
        let buffer = OutboundPolicy::Buffer { capacity: 8 };
        emitter.emit(Frame::new("user-message", "stale"), buffer).await;

        h.connection.disconnect().await;
        h.connection.connect(endpoint(), ConnectOptions::default());
        wait_for(&h.connection, ConnectionState::Connected).await;
        emitter.emit(Frame::new("user-message", "fresh"), buffer).await;

        let mut peer = h.server.accept().await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::new("user-message", "fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_actor() {
        let mut h = harness();
        h.connection.connect(endpoint(), ConnectOptions::default());
        let mut state = h.connection.state_watch();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        let peer = h.server.accept().await.unwrap();

        drop(h.connection);
        // The actor publishes its final state, then the sender goes away.
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.is_closed());
    }
}
