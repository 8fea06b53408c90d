//! Inbound event routing.
//!
//! One handler per [`EventKind`]. Registering again replaces the previous
//! handler, so remounting a view never stacks duplicate deliveries. A
//! registration is held by a [`Subscription`]; dropping it releases the
//! handler unless a newer registration has already replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::trace;

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::protocol::{EventKind, InboundEvent};

pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

type HandlerMap = Mutex<HashMap<EventKind, Registration>>;

/// Outcome of a single dispatch, mostly useful to tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran.
    Delivered,
    /// The name is not one we route.
    Unknown,
    /// Recognised, but nobody is listening.
    Unhandled,
    /// The payload failed validation; a diagnostic was reported.
    Rejected,
}

#[derive(Clone)]
pub struct EventRouter {
    handlers: Arc<HandlerMap>,
    next_id: Arc<AtomicU64>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl EventRouter {
    pub fn new(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            diagnostics,
        }
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<EventKind, Registration>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .handlers()
            .insert(
                kind,
                Registration {
                    id,
                    handler: Arc::new(handler),
                },
            )
            .is_some();
        trace!(event = %kind, replaced, "handler registered");
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            kind,
            id,
        }
    }

    /// Remove whatever handler is registered for `kind`.
    pub fn off(&self, kind: EventKind) {
        self.handlers().remove(&kind);
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.handlers().clear();
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers().contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers().len()
    }

    /// Route a raw named event. Never panics into the caller on bad input.
    pub fn dispatch(&self, event_name: &str, payload: Option<&Value>) -> Dispatch {
        let Some(kind) = EventKind::from_name(event_name) else {
            trace!(event = %event_name, "ignoring unknown event");
            return Dispatch::Unknown;
        };

        // Bad payloads are reported whether or not anyone is listening.
        let event = match InboundEvent::decode(kind, payload) {
            Ok(event) => event,
            Err(error) => {
                self.diagnostics
                    .report(Diagnostic::MalformedPayload { error });
                return Dispatch::Rejected;
            }
        };

        // Clone out of the lock so a handler may register or unregister.
        let handler = match self.handlers().get(&kind) {
            Some(registration) => registration.handler.clone(),
            None => return Dispatch::Unhandled,
        };
        handler(&event);
        Dispatch::Delivered
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&'static str> = self.handlers().keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("EventRouter").field("handlers", &kinds).finish()
    }
}

/// Scoped handler registration.
#[derive(Debug)]
pub struct Subscription {
    handlers: Weak<HandlerMap>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether this registration is still the active handler for its event.
    pub fn is_active(&self) -> bool {
        self.handlers.upgrade().is_some_and(|handlers| {
            handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&self.kind)
                .is_some_and(|r| r.id == self.id)
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut handlers = handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.get(&self.kind).is_some_and(|r| r.id == self.id) {
            handlers.remove(&self.kind);
            trace!(event = %self.kind, "handler released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingSink;
    use crate::protocol::{Task, WorkspaceSnapshot};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn router() -> (EventRouter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (EventRouter::new(sink.clone()), sink)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&InboundEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &InboundEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn last_registration_wins() {
        let (router, _) = router();
        let (first, first_handler) = counter();
        let (second, second_handler) = counter();

        let _a = router.on(EventKind::AssistantReply, first_handler);
        let _b = router.on(EventKind::AssistantReply, second_handler);

        assert_eq!(
            router.dispatch("assistant-reply", Some(&json!("hi"))),
            Dispatch::Delivered
        );
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(router.handler_count(), 1);
    }

    #[test]
    fn dropping_subscription_releases_handler() {
        let (router, _) = router();
        let (count, handler) = counter();
        let sub = router.on(EventKind::AssistantReply, handler);
        assert!(sub.is_active());
        drop(sub);

        assert!(!router.is_registered(EventKind::AssistantReply));
        assert_eq!(
            router.dispatch("assistant-reply", Some(&json!("hi"))),
            Dispatch::Unhandled
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_subscription_does_not_remove_replacement() {
        let (router, _) = router();
        let (_, old_handler) = counter();
        let (count, new_handler) = counter();

        let old = router.on(EventKind::WorkspaceUpdate, old_handler);
        let new = router.on(EventKind::WorkspaceUpdate, new_handler);
        assert!(!old.is_active());
        drop(old);

        assert!(new.is_active());
        router.dispatch("workspace-update", Some(&json!({"tasks": []})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_and_clear() {
        let (router, _) = router();
        let _a = router.on(EventKind::Connect, |_| {});
        let _b = router.on(EventKind::Disconnect, |_| {});
        router.off(EventKind::Connect);
        assert!(!router.is_registered(EventKind::Connect));
        assert!(router.is_registered(EventKind::Disconnect));
        router.clear();
        assert_eq!(router.handler_count(), 0);
    }

    #[test]
    fn unknown_events_are_ignored_silently() {
        let (router, sink) = router();
        assert_eq!(router.dispatch("typing", Some(&json!(1))), Dispatch::Unknown);
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn malformed_payload_is_dropped_and_reported() {
        let (router, sink) = router();
        let (count, handler) = counter();
        let _sub = router.on(EventKind::WorkspaceUpdate, handler);

        assert_eq!(
            router.dispatch("workspace-update", Some(&json!("not an object"))),
            Dispatch::Rejected
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sink.malformed().len(), 1);
    }

    #[test]
    fn malformed_payload_is_reported_without_a_handler() {
        let (router, sink) = router();
        assert_eq!(
            router.dispatch("assistant-reply", Some(&json!({"text": "hi"}))),
            Dispatch::Rejected
        );
        assert_eq!(
            router.dispatch("assistant-reply", Some(&json!("hi"))),
            Dispatch::Unhandled
        );
        assert_eq!(sink.malformed().len(), 1);
    }

    #[test]
    fn handler_receives_typed_event() {
        let (router, _) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = router.on(EventKind::WorkspaceUpdate, move |event| {
            s.lock().unwrap().push(event.clone());
        });

        router.dispatch(
            "workspace_update",
            Some(&json!({"tasks": [{"id": 3, "description": "c"}]})),
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![InboundEvent::WorkspaceUpdate(WorkspaceSnapshot::new(vec![
                Task::new(3, "c")
            ]))]
        );
    }

    #[test]
    fn handler_may_reregister_during_dispatch() {
        let (router, _) = router();
        let inner = router.clone();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let sub = router.on(EventKind::Connect, move |_| {
            let replacement = inner.on(EventKind::Connect, |_| {});
            *s.lock().unwrap() = Some(replacement);
        });

        assert_eq!(router.dispatch("connect", None), Dispatch::Delivered);
        assert!(!sub.is_active());
        assert!(slot.lock().unwrap().as_ref().unwrap().is_active());
    }

    #[test]
    fn subscription_outliving_router_is_harmless() {
        let (router, _) = router();
        let sub = router.on(EventKind::Connect, |_| {});
        drop(router);
        assert!(!sub.is_active());
        drop(sub);
    }
}
