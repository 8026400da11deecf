//! Event model.
//!
//! Every unit of work in the runtime is an [`Event`]: a header (id, origin,
//! priority) plus an [`EventKind`] payload. Internal kinds drive the service
//! lifecycle, dependency resolution, and coroutine resumption; user events
//! carry an arbitrary `Any + Send + Sync` payload and are routed through
//! interceptors and handlers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::manager::DependencyManager;
use crate::types::{EventId, EventTypeHash, InterceptorId, InterfaceHash, PromiseId, ServiceId};

/// Default priority for internal and user events. Lower value fires earlier.
pub const INTERNAL_EVENT_PRIORITY: u64 = 1000;
/// Priority of dependency online/offline/request events.
pub const INTERNAL_DEPENDENCY_EVENT_PRIORITY: u64 = 100; // only go below if you know what you're doing
/// Priority of coroutine continuation events.
pub const INTERNAL_COROUTINE_EVENT_PRIORITY: u64 = 98; // only go below if you know what you're doing
/// Priority of service insertion events.
pub const INTERNAL_INSERT_SERVICE_EVENT_PRIORITY: u64 = 50; // only go below if you know what you're doing
/// Priority at which stop/teardown events are (re-)pushed: cleanup preempts
/// new user work but still yields to higher-priority internal events.
pub const INTERNAL_STOP_SERVICE_EVENT_PRIORITY: u64 = INTERNAL_EVENT_PRIORITY + 11;

/// Handler verdict: whether later handlers see the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Continue,
    StopPropagation,
}

/// A prioritized event. Immutable once pushed.
#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub origin: ServiceId,
    pub priority: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn type_hash(&self) -> EventTypeHash {
        self.kind.type_hash()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// The closed set of internal event variants plus user payloads.
#[derive(Debug)]
pub enum EventKind {
    /// Move a pending service into the registry and evaluate its edges.
    InsertService(ServiceId),
    /// Drive a service towards `Active`.
    StartService(ServiceId),
    /// Drive a service out of `Active`; `remove_after` requests removal once
    /// its stop completes.
    StopService {
        service: ServiceId,
        remove_after: bool,
    },
    /// Uninstall an installed service and drop it from the registry.
    RemoveService(ServiceId),
    /// A provider reached `Active`; deliver it to requesting services.
    DependencyOnline { provider: ServiceId },
    /// A provider is leaving `Active`; withdraw it from dependents.
    DependencyOffline {
        provider: ServiceId,
        remove_after: bool,
    },
    /// A service declared an edge nobody currently satisfies; observed by
    /// dependency trackers.
    DependencyRequest {
        requester: ServiceId,
        interface: InterfaceHash,
    },
    /// The requester went away; trackers undo per-requester work.
    DependencyUndoRequest {
        requester: ServiceId,
        interface: InterfaceHash,
    },
    /// Resume the suspended continuation with the given promise id.
    Continuable(PromiseId),
    /// Resume a suspended lifecycle (start/stop) continuation.
    ContinuableStart(PromiseId),
    /// Re-check whether an offline provider's dependents have drained so its
    /// stop can proceed.
    ContinuableDependencyOffline {
        provider: ServiceId,
        remove_after: bool,
    },
    /// Run a closure on the event loop thread.
    RunFunction(RunFunction),
    /// De-register a handler (pushed when its registration token drops).
    RemoveHandler {
        service: ServiceId,
        event_type: EventTypeHash,
    },
    /// De-register an interceptor.
    RemoveInterceptor {
        service: ServiceId,
        interceptor: InterceptorId,
    },
    /// De-register a dependency tracker.
    RemoveTracker {
        service: ServiceId,
        interface: InterfaceHash,
    },
    /// Begin shutdown: stop and remove every service, then terminate the loop.
    Quit,
    /// A user-defined event payload.
    User(UserPayload),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::InsertService(_) => "InsertServiceEvent",
            EventKind::StartService(_) => "StartServiceEvent",
            EventKind::StopService { .. } => "StopServiceEvent",
            EventKind::RemoveService(_) => "RemoveServiceEvent",
            EventKind::DependencyOnline { .. } => "DependencyOnlineEvent",
            EventKind::DependencyOffline { .. } => "DependencyOfflineEvent",
            EventKind::DependencyRequest { .. } => "DependencyRequestEvent",
            EventKind::DependencyUndoRequest { .. } => "DependencyUndoRequestEvent",
            EventKind::Continuable(_) => "ContinuableEvent",
            EventKind::ContinuableStart(_) => "ContinuableStartEvent",
            EventKind::ContinuableDependencyOffline { .. } => "ContinuableDependencyOfflineEvent",
            EventKind::RunFunction(_) => "RunFunctionEvent",
            EventKind::RemoveHandler { .. } => "RemoveEventHandlerEvent",
            EventKind::RemoveInterceptor { .. } => "RemoveEventInterceptorEvent",
            EventKind::RemoveTracker { .. } => "RemoveTrackerEvent",
            EventKind::Quit => "QuitEvent",
            EventKind::User(payload) => payload.name,
        }
    }

    pub fn type_hash(&self) -> EventTypeHash {
        match self {
            EventKind::User(payload) => payload.type_hash,
            internal => EventTypeHash::from_name(internal.name()),
        }
    }
}

/// Type-erased user event payload.
///
/// Built from any `Any + Send + Sync` value; the payload is reference-counted
/// so every handler observes the same immutable instance.
#[derive(Clone)]
pub struct UserPayload {
    pub type_hash: EventTypeHash,
    pub name: &'static str,
    pub data: Arc<dyn Any + Send + Sync>,
}

impl UserPayload {
    pub fn new<E: Any + Send + Sync>(payload: E) -> Self {
        Self {
            type_hash: EventTypeHash::of::<E>(),
            name: std::any::type_name::<E>(),
            data: Arc::new(payload),
        }
    }

    pub fn downcast<E: Any + Send + Sync>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.data).downcast::<E>().ok()
    }
}

impl fmt::Debug for UserPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPayload")
            .field("name", &self.name)
            .field("type_hash", &self.type_hash)
            .finish()
    }
}

/// A deferred closure executed on the event loop thread with access to the
/// dependency manager.
pub struct RunFunction(Box<dyn FnOnce(&DependencyManager) + Send>);

impl RunFunction {
    pub fn new(f: impl FnOnce(&DependencyManager) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub(crate) fn invoke(self, dm: &DependencyManager) {
        (self.0)(dm)
    }
}

impl fmt::Debug for RunFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunFunction")
    }
}

/// Immutable view of an event handed to interceptors.
///
/// Carries the header plus, for user events, the payload.
#[derive(Debug, Clone)]
pub struct EventView {
    pub id: EventId,
    pub origin: ServiceId,
    pub priority: u64,
    pub type_hash: EventTypeHash,
    pub name: &'static str,
    pub payload: Option<UserPayload>,
}

impl EventView {
    pub(crate) fn of(event: &Event) -> Self {
        let payload = match &event.kind {
            EventKind::User(payload) => Some(payload.clone()),
            _ => None,
        };
        Self {
            id: event.id,
            origin: event.origin,
            priority: event.priority,
            type_hash: event.type_hash(),
            name: event.name(),
            payload,
        }
    }
}
