//! The dependency manager: per-loop service registry and event dispatcher.
//!
//! The manager owns every lifecycle host on one event loop, the handler/
//! interceptor/tracker tables, and the continuation table for suspended
//! coroutines. It is the only entity that mutates registry state, and it
//! does so exclusively on the loop thread.
//!
//! The handle itself is a cheap clone (shared core); it is deliberately
//! `!Send`; cross-loop traffic goes through the
//! [`CommunicationChannel`](crate::channel::CommunicationChannel).

use futures::future::{FutureExt, LocalBoxFuture};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use uuid::Uuid;

use crate::channel::CommunicationChannel;
use crate::coroutines::waker::{continuation_waker, ContinuationClass};
use crate::coroutines::{AsyncManualResetEvent, Task};
use crate::events::{
    Behaviour, Event, EventKind, EventView, INTERNAL_DEPENDENCY_EVENT_PRIORITY,
    INTERNAL_EVENT_PRIORITY, INTERNAL_INSERT_SERVICE_EVENT_PRIORITY,
    INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
};
use crate::lifecycle::LifecycleHost;
use crate::queue::EventQueue;
use crate::service::{
    AdvancedService, InjectedService, Properties, ServiceContext, ServiceInfo, ServiceState,
};
use crate::types::{
    Error, EventId, EventTypeHash, InterceptorId, InterfaceHash, ManagerId, PromiseId, Result,
    ServiceId, StartError,
};

mod builder;
mod metrics;
mod registrations;

pub use builder::{AdvancedServiceBuilder, InjectedServiceBuilder, ServiceProxy};
pub use metrics::RuntimeMetrics;
pub use registrations::{
    DependencyTrackerRegistration, EventHandlerRegistration, EventInterceptorRegistration,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Table entries
// ---------------------------------------------------------------------------

type ErasedHandler = dyn Fn(Arc<dyn Any + Send + Sync>) -> LocalBoxFuture<'static, Behaviour>;

struct HandlerEntry {
    id: u64,
    service: ServiceId,
    filter: Option<ServiceId>,
    callback: Rc<ErasedHandler>,
}

struct InterceptorFns {
    pre: Box<dyn Fn(&EventView) -> bool>,
    post: Box<dyn Fn(&EventView, bool)>,
}

struct InterceptorEntry {
    id: InterceptorId,
    service: ServiceId,
    event_type: Option<EventTypeHash>,
    fns: Rc<InterceptorFns>,
}

type TrackerCallback = dyn Fn(&DependencyManager, &DependencyRequest);

struct TrackerFns {
    on_request: Box<TrackerCallback>,
    on_undo: Box<TrackerCallback>,
}

struct TrackerEntry {
    service: ServiceId,
    fns: Rc<TrackerFns>,
}

/// A dependency request observed by trackers: some service declared an edge
/// on `interface` that no current provider satisfies.
#[derive(Debug, Clone)]
pub struct DependencyRequest {
    pub requester: ServiceId,
    pub interface: InterfaceHash,
    /// Requester properties at request time (empty on undo after removal).
    pub properties: Properties,
}

struct Continuation {
    owner: ServiceId,
    class: ContinuationClass,
    future: LocalBoxFuture<'static, ()>,
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

struct DmCore {
    next_service_id: u64,
    next_promise_id: u64,
    next_handler_id: u64,
    next_interceptor_id: u64,
    services: HashMap<ServiceId, LifecycleHost>,
    pending_installs: HashMap<ServiceId, LifecycleHost>,
    interface_index: HashMap<InterfaceHash, std::collections::BTreeSet<ServiceId>>,
    handlers: HashMap<EventTypeHash, Vec<HandlerEntry>>,
    interceptors: Vec<InterceptorEntry>,
    trackers: HashMap<InterfaceHash, Vec<TrackerEntry>>,
    continuations: HashMap<PromiseId, Continuation>,
    metrics: RuntimeMetrics,
    channel: Option<CommunicationChannel>,
    quitting: bool,
}

impl DmCore {
    fn new() -> Self {
        Self {
            next_service_id: 1,
            next_promise_id: 1,
            next_handler_id: 1,
            next_interceptor_id: 1,
            services: HashMap::new(),
            pending_installs: HashMap::new(),
            interface_index: HashMap::new(),
            handlers: HashMap::new(),
            interceptors: Vec::new(),
            trackers: HashMap::new(),
            continuations: HashMap::new(),
            metrics: RuntimeMetrics::default(),
            channel: None,
            quitting: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-local loop context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_MANAGER: RefCell<Option<DependencyManager>> = const { RefCell::new(None) };
}

/// The manager whose loop is running on this thread, if any.
pub fn get_thread_local_manager() -> Option<DependencyManager> {
    CURRENT_MANAGER.with(|slot| slot.borrow().clone())
}

/// The event queue of the loop running on this thread, if any.
pub fn get_thread_local_event_queue() -> Option<EventQueue> {
    get_thread_local_manager().map(|dm| dm.event_queue().clone())
}

struct ThreadSlotGuard {
    previous: Option<DependencyManager>,
}

impl ThreadSlotGuard {
    fn set(dm: &DependencyManager) -> Self {
        let previous =
            CURRENT_MANAGER.with(|slot| slot.borrow_mut().replace(dm.clone()));
        Self { previous }
    }
}

impl Drop for ThreadSlotGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_MANAGER.with(|slot| *slot.borrow_mut() = previous);
    }
}

// ---------------------------------------------------------------------------
// DependencyManager
// ---------------------------------------------------------------------------

/// Per-loop registry and dispatcher. Cheap to clone; `!Send`.
pub struct DependencyManager {
    core: Rc<RefCell<DmCore>>,
    queue: EventQueue,
    id: ManagerId,
}

impl Clone for DependencyManager {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            queue: self.queue.clone(),
            id: self.id,
        }
    }
}

impl fmt::Debug for DependencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("DependencyManager")
            .field("id", &self.id)
            .field("services", &core.services.len())
            .field("pending", &core.pending_installs.len())
            .field("continuations", &core.continuations.len())
            .finish()
    }
}

impl EventQueue {
    /// Create the dependency manager owning this queue's loop.
    pub fn create_manager(&self) -> DependencyManager {
        DependencyManager::new(self.clone())
    }
}

impl DependencyManager {
    fn new(queue: EventQueue) -> Self {
        Self {
            core: Rc::new(RefCell::new(DmCore::new())),
            queue,
            id: ManagerId::from_raw(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    /// The broadcast channel this manager is registered on, if any.
    pub fn communication_channel(&self) -> Option<CommunicationChannel> {
        self.core.borrow().channel.clone()
    }

    pub(crate) fn set_channel(&self, channel: Option<CommunicationChannel>) {
        self.core.borrow_mut().channel = channel;
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.core.borrow().metrics.clone()
    }

    // -- service creation ---------------------------------------------------

    /// Create an advanced service (explicit dependency registration plus
    /// async start/stop).
    pub fn create_service_manager<S: AdvancedService>(
        &self,
        properties: Properties,
    ) -> AdvancedServiceBuilder<'_, S> {
        AdvancedServiceBuilder {
            dm: self,
            properties,
            priority: builder::default_builder_priority(),
            casts: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Create a constructor-injected service.
    pub fn create_injected_service_manager<S: InjectedService>(
        &self,
        properties: Properties,
    ) -> InjectedServiceBuilder<'_, S> {
        InjectedServiceBuilder {
            dm: self,
            properties,
            priority: builder::default_builder_priority(),
            casts: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn install_advanced<S: AdvancedService>(
        &self,
        properties: Properties,
        priority: u64,
        casts: Vec<builder::CastRegistrar>,
    ) -> Result<ServiceProxy<S>> {
        let info = self.allocate_info::<S>(properties, priority);
        let id = info.id;
        let ctx = ServiceContext::new(self.queue.clone(), id, priority);
        let mut host = LifecycleHost::new_advanced::<S>(info, ctx);
        for cast in casts {
            cast(&mut host);
        }
        self.check_for_cycles(&host)?;
        let proxy = ServiceProxy {
            id,
            gid: host.info.gid,
            instance: host.downgrade::<S>(),
        };
        self.schedule_insert(host);
        Ok(proxy)
    }

    pub(crate) fn install_injected<S: InjectedService>(
        &self,
        properties: Properties,
        priority: u64,
        casts: Vec<builder::CastRegistrar>,
    ) -> Result<ServiceProxy<S>> {
        let info = self.allocate_info::<S>(properties, priority);
        let id = info.id;
        let mut host = LifecycleHost::new_injected::<S>(info);
        for cast in casts {
            cast(&mut host);
        }
        self.check_for_cycles(&host)?;
        let proxy = ServiceProxy {
            id,
            gid: host.info.gid,
            instance: None,
        };
        self.schedule_insert(host);
        Ok(proxy)
    }

    fn allocate_info<S: 'static>(&self, properties: Properties, priority: u64) -> ServiceInfo {
        let mut core = self.core.borrow_mut();
        let id = ServiceId::from_raw(core.next_service_id);
        core.next_service_id += 1;
        ServiceInfo {
            id,
            gid: Uuid::new_v4(),
            name: std::any::type_name::<S>(),
            priority,
            state: ServiceState::Installed,
            properties,
        }
    }

    fn schedule_insert(&self, host: LifecycleHost) {
        let id = host.id();
        tracing::debug!(service = %id, name = host.info.name, "service created");
        self.core.borrow_mut().pending_installs.insert(id, host);
        self.queue.push_kind(
            id,
            INTERNAL_INSERT_SERVICE_EVENT_PRIORITY,
            EventKind::InsertService(id),
        );
    }

    /// Reject creation when the candidate's required edges close a cycle
    /// through services that provide its interfaces.
    fn check_for_cycles(&self, candidate: &LifecycleHost) -> Result<()> {
        let core = self.core.borrow();

        // interface -> declared providers, across installed and pending
        // services plus the candidate.
        let mut providers: HashMap<InterfaceHash, Vec<ServiceId>> = HashMap::new();
        let mut required: HashMap<ServiceId, Vec<InterfaceHash>> = HashMap::new();
        let all_hosts = core
            .services
            .values()
            .chain(core.pending_installs.values())
            .chain(std::iter::once(candidate));
        for host in all_hosts {
            for hash in &host.provided {
                providers.entry(*hash).or_default().push(host.id());
            }
            required.insert(
                host.id(),
                host.declared
                    .iter()
                    .filter(|dep| dep.is_required())
                    .map(|dep| dep.interface)
                    .collect(),
            );
        }

        // DFS over required edges, looking for a cycle through the candidate.
        let start = candidate.id();
        let mut stack: Vec<ServiceId> = vec![start];
        let mut visited: std::collections::BTreeSet<ServiceId> = Default::default();
        while let Some(current) = stack.pop() {
            for hash in required.get(&current).into_iter().flatten() {
                for provider in providers.get(hash).into_iter().flatten() {
                    if *provider == start {
                        return Err(Error::dependency_cycle(format!(
                            "required edges of {} ({}) close a cycle",
                            start, candidate.info.name
                        )));
                    }
                    if visited.insert(*provider) {
                        stack.push(*provider);
                    }
                }
            }
        }
        Ok(())
    }

    // -- registry queries ---------------------------------------------------

    /// Metadata snapshot of a service.
    pub fn get_service_by_id(&self, id: ServiceId) -> Option<ServiceInfo> {
        let core = self.core.borrow();
        core.services
            .get(&id)
            .or_else(|| core.pending_installs.get(&id))
            .map(|host| host.info.clone())
    }

    /// Snapshot of every installed service, ordered by id.
    pub fn services(&self) -> Vec<ServiceInfo> {
        let core = self.core.borrow();
        let mut infos: Vec<ServiceInfo> =
            core.services.values().map(|host| host.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn service_count(&self) -> usize {
        self.core.borrow().services.len()
    }

    /// Installed services currently providing `I`, ordered by id.
    pub fn services_providing<I: ?Sized + 'static>(&self) -> Vec<ServiceId> {
        let core = self.core.borrow();
        core.interface_index
            .get(&InterfaceHash::of::<I>())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    // -- registration APIs --------------------------------------------------

    /// Register a handler for user events of type `E`.
    ///
    /// Handlers run in registration order; a handler yielding
    /// [`Behaviour::StopPropagation`] hides the event from later handlers.
    /// `filter` restricts dispatch to events originating from one service.
    pub fn register_event_handler<E, F, Fut>(
        &self,
        service: ServiceId,
        filter: Option<ServiceId>,
        callback: F,
    ) -> EventHandlerRegistration
    where
        E: Any + Send + Sync,
        F: Fn(Arc<E>) -> Fut + 'static,
        Fut: Future<Output = Behaviour> + 'static,
    {
        let erased: Rc<ErasedHandler> = Rc::new(move |data: Arc<dyn Any + Send + Sync>| {
            match data.downcast::<E>() {
                Ok(event) => callback(event).boxed_local(),
                Err(_) => futures::future::ready(Behaviour::Continue).boxed_local(),
            }
        });
        let event_type = EventTypeHash::of::<E>();
        {
            let mut core = self.core.borrow_mut();
            let id = core.next_handler_id;
            core.next_handler_id += 1;
            core.handlers.entry(event_type).or_default().push(HandlerEntry {
                id,
                service,
                filter,
                callback: erased,
            });
        }
        EventHandlerRegistration {
            queue: self.queue.clone(),
            service,
            event_type,
            priority: INTERNAL_EVENT_PRIORITY,
        }
    }

    /// Register an interceptor for user events of type `E`.
    pub fn register_event_interceptor<E: Any + Send + Sync>(
        &self,
        service: ServiceId,
        pre: impl Fn(&EventView) -> bool + 'static,
        post: impl Fn(&EventView, bool) + 'static,
    ) -> EventInterceptorRegistration {
        self.register_interceptor_inner(service, Some(EventTypeHash::of::<E>()), pre, post)
    }

    /// Register an interceptor observing every event, internal ones included.
    pub fn register_global_interceptor(
        &self,
        service: ServiceId,
        pre: impl Fn(&EventView) -> bool + 'static,
        post: impl Fn(&EventView, bool) + 'static,
    ) -> EventInterceptorRegistration {
        self.register_interceptor_inner(service, None, pre, post)
    }

    fn register_interceptor_inner(
        &self,
        service: ServiceId,
        event_type: Option<EventTypeHash>,
        pre: impl Fn(&EventView) -> bool + 'static,
        post: impl Fn(&EventView, bool) + 'static,
    ) -> EventInterceptorRegistration {
        let id = {
            let mut core = self.core.borrow_mut();
            let id = InterceptorId::from_raw(core.next_interceptor_id);
            core.next_interceptor_id += 1;
            core.interceptors.push(InterceptorEntry {
                id,
                service,
                event_type,
                fns: Rc::new(InterceptorFns {
                    pre: Box::new(pre),
                    post: Box::new(post),
                }),
            });
            id
        };
        EventInterceptorRegistration {
            queue: self.queue.clone(),
            service,
            interceptor: id,
            priority: INTERNAL_EVENT_PRIORITY,
        }
    }

    /// Register a dependency tracker for interface `I`.
    ///
    /// `on_request` fires when a service declares an unsatisfied edge on
    /// `I` (commonly answered by creating a provider); `on_undo` fires when
    /// the requester goes away. Services already waiting on `I` are replayed
    /// to the new tracker immediately. Both callbacks may fire more than
    /// once per requester and must be idempotent.
    pub fn register_dependency_tracker<I: ?Sized + 'static>(
        &self,
        service: ServiceId,
        on_request: impl Fn(&DependencyManager, &DependencyRequest) + 'static,
        on_undo: impl Fn(&DependencyManager, &DependencyRequest) + 'static,
    ) -> DependencyTrackerRegistration {
        let interface = InterfaceHash::of::<I>();
        let fns = Rc::new(TrackerFns {
            on_request: Box::new(on_request),
            on_undo: Box::new(on_undo),
        });
        self.core
            .borrow_mut()
            .trackers
            .entry(interface)
            .or_default()
            .push(TrackerEntry {
                service,
                fns: Rc::clone(&fns),
            });

        // Replay edges that requested this interface before the tracker
        // existed.
        let waiting: Vec<DependencyRequest> = {
            let core = self.core.borrow();
            core.services
                .values()
                .filter(|host| {
                    host.declared
                        .find(interface)
                        .map(|dep| dep.satisfied == 0)
                        .unwrap_or(false)
                })
                .map(|host| DependencyRequest {
                    requester: host.id(),
                    interface,
                    properties: host.info.properties.clone(),
                })
                .collect()
        };
        for request in waiting {
            (fns.on_request)(self, &request);
        }

        DependencyTrackerRegistration {
            queue: self.queue.clone(),
            service,
            interface,
            priority: INTERNAL_EVENT_PRIORITY,
        }
    }

    // -- coroutine integration ----------------------------------------------

    /// Spawn an eager task owned by `owner`. The task is discarded (and its
    /// awaiters observe cancellation) when the owner leaves `Active`.
    pub fn spawn_task<T: 'static>(
        &self,
        owner: ServiceId,
        future: impl Future<Output = T> + 'static,
    ) -> Task<T> {
        let (task, completion) = Task::new_pair();
        let wrapped = async move {
            completion.complete(future.await);
        };
        self.drive_continuation(owner, ContinuationClass::Work, Box::pin(wrapped));
        task
    }

    fn drive_continuation(
        &self,
        owner: ServiceId,
        class: ContinuationClass,
        future: LocalBoxFuture<'static, ()>,
    ) {
        let promise = {
            let mut core = self.core.borrow_mut();
            let promise = PromiseId::from_raw(core.next_promise_id);
            core.next_promise_id += 1;
            core.metrics.continuations_scheduled += 1;
            promise
        };
        self.poll_continuation(promise, Continuation { owner, class, future });
    }

    fn poll_continuation(&self, promise: PromiseId, mut continuation: Continuation) {
        let waker = continuation_waker(
            self.queue.clone(),
            promise,
            continuation.owner,
            continuation.class,
        );
        let mut cx = Context::from_waker(&waker);
        match continuation.future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => {
                self.core
                    .borrow_mut()
                    .continuations
                    .insert(promise, continuation);
            }
        }
    }

    fn resume_continuation(&self, promise: PromiseId) {
        let Some(continuation) = self.core.borrow_mut().continuations.remove(&promise) else {
            tracing::trace!(%promise, "spurious continuation resume");
            return;
        };
        let live = {
            let core = self.core.borrow();
            match continuation.class {
                ContinuationClass::Lifecycle => {
                    continuation.owner == ServiceId::FRAMEWORK
                        || core.services.contains_key(&continuation.owner)
                }
                ContinuationClass::Work => {
                    continuation.owner == ServiceId::FRAMEWORK
                        || core
                            .services
                            .get(&continuation.owner)
                            .map(|host| !host.state().is_past_active())
                            .unwrap_or(false)
                }
            }
        };
        if !live {
            tracing::debug!(
                %promise,
                owner = %continuation.owner,
                "continuation discarded, owner no longer live"
            );
            self.core.borrow_mut().metrics.continuations_discarded += 1;
            return;
        }
        self.poll_continuation(promise, continuation);
    }

    /// Drop continuations owned by `service`. Work continuations only, or
    /// every class when `all` is set (service removal).
    fn discard_continuations(&self, service: ServiceId, all: bool) {
        let mut core = self.core.borrow_mut();
        let before = core.continuations.len();
        core.continuations.retain(|_, continuation| {
            continuation.owner != service
                || (!all && continuation.class == ContinuationClass::Lifecycle)
        });
        let dropped = (before - core.continuations.len()) as u64;
        core.metrics.continuations_discarded += dropped;
        drop(core);
        if dropped > 0 {
            tracing::debug!(service = %service, dropped, "continuations discarded");
        }
    }

    // -- event loop ---------------------------------------------------------

    /// Run the loop on the current thread until shutdown completes.
    ///
    /// Installs the process-wide SIGINT handler first when
    /// `capture_sigint` is set (at most once per process).
    pub fn start(&self, capture_sigint: bool) -> Result<()> {
        if capture_sigint {
            crate::queue::install_sigint_handler()?;
        }
        let _slot = ThreadSlotGuard::set(self);
        self.queue.mark_running(true);
        tracing::info!(manager = %self.id, "event loop started");
        while let Some(event) = self.queue.blocking_pop() {
            self.process_event(event);
            self.check_quit_termination();
        }
        self.queue.mark_running(false);
        tracing::info!(manager = %self.id, "event loop stopped");
        Ok(())
    }

    /// Drain currently queued events without blocking; returns how many were
    /// processed. Intended for embedding and tests; `start` is the normal
    /// entry point.
    pub fn run_until_idle(&self) -> usize {
        let _slot = ThreadSlotGuard::set(self);
        let mut processed = 0;
        while let Some(event) = self.queue.try_pop() {
            self.process_event(event);
            self.check_quit_termination();
            processed += 1;
        }
        processed
    }

    fn check_quit_termination(&self) {
        let finished = {
            let core = self.core.borrow();
            core.quitting && core.services.is_empty() && core.pending_installs.is_empty()
        };
        if finished {
            self.queue.terminate();
        }
    }

    pub(crate) fn process_event(&self, event: Event) {
        let view = EventView::of(&event);
        tracing::trace!(event = view.name, id = %view.id, priority = view.priority, "processing");

        let interceptors: Vec<Rc<InterceptorFns>> = {
            let core = self.core.borrow();
            core.interceptors
                .iter()
                .filter(|entry| entry.event_type.map_or(true, |t| t == view.type_hash))
                .map(|entry| Rc::clone(&entry.fns))
                .collect()
        };

        let mut allowed = true;
        for fns in &interceptors {
            if !(fns.pre)(&view) {
                allowed = false;
            }
        }

        let processed = if allowed {
            self.dispatch(event)
        } else {
            self.core.borrow_mut().metrics.events_suppressed += 1;
            self.queue.complete_event(view.id);
            false
        };

        for fns in &interceptors {
            (fns.post)(&view, allowed && processed);
        }
        self.core.borrow_mut().metrics.events_processed += 1;
    }

    fn dispatch(&self, event: Event) -> bool {
        let event_id = event.id;
        match event.kind {
            EventKind::User(payload) => {
                return self.dispatch_user_event(event_id, event.origin, payload);
            }
            EventKind::InsertService(service) => self.handle_insert(service),
            EventKind::StartService(service) => self.handle_start(service),
            EventKind::StopService {
                service,
                remove_after,
            } => self.handle_stop(service, remove_after),
            EventKind::RemoveService(service) => self.handle_remove(service),
            EventKind::DependencyOnline { provider } => self.handle_dependency_online(provider),
            EventKind::DependencyOffline {
                provider,
                remove_after,
            } => self.handle_dependency_offline(provider, remove_after),
            EventKind::DependencyRequest {
                requester,
                interface,
            } => self.handle_dependency_request(requester, interface),
            EventKind::DependencyUndoRequest {
                requester,
                interface,
            } => self.handle_dependency_undo(requester, interface),
            EventKind::Continuable(promise) | EventKind::ContinuableStart(promise) => {
                self.resume_continuation(promise)
            }
            EventKind::ContinuableDependencyOffline {
                provider,
                remove_after,
            } => self.handle_continuable_offline(provider, remove_after),
            EventKind::RunFunction(function) => function.invoke(self),
            EventKind::RemoveHandler {
                service,
                event_type,
            } => self.remove_handler_entries(service, event_type),
            EventKind::RemoveInterceptor { interceptor, .. } => {
                self.core
                    .borrow_mut()
                    .interceptors
                    .retain(|entry| entry.id != interceptor);
            }
            EventKind::RemoveTracker { service, interface } => {
                self.remove_tracker_entries(service, interface);
            }
            EventKind::Quit => self.handle_quit(),
        }
        self.queue.complete_event(event_id);
        true
    }

    // -- user event dispatch ------------------------------------------------

    fn dispatch_user_event(
        &self,
        event_id: EventId,
        origin: ServiceId,
        payload: crate::events::UserPayload,
    ) -> bool {
        let type_hash = payload.type_hash;
        let entries: Vec<(u64, ServiceId, Rc<ErasedHandler>)> = {
            let core = self.core.borrow();
            core.handlers
                .get(&type_hash)
                .map(|handlers| {
                    handlers
                        .iter()
                        .filter(|entry| entry.filter.map_or(true, |f| f == origin))
                        .map(|entry| (entry.id, entry.service, Rc::clone(&entry.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        if entries.is_empty() {
            self.queue.complete_event(event_id);
            return false;
        }

        let dm = self.clone();
        let data = Arc::clone(&payload.data);
        let sweep = async move {
            for (handler_id, service, callback) in entries {
                // A handler invalidated since the event was popped is skipped.
                let still_registered = {
                    let core = dm.core.borrow();
                    core.handlers
                        .get(&type_hash)
                        .map(|handlers| handlers.iter().any(|entry| entry.id == handler_id))
                        .unwrap_or(false)
                };
                if !still_registered {
                    continue;
                }

                dm.core.borrow_mut().metrics.handlers_invoked += 1;
                let verdict = Rc::new(Cell::new(Behaviour::Continue));
                let gate = AsyncManualResetEvent::new();
                let handler_future = handler_run(
                    dm.clone(),
                    callback(Arc::clone(&data)),
                    Rc::clone(&verdict),
                    gate.clone(),
                );
                dm.drive_continuation(service, ContinuationClass::Work, Box::pin(handler_future));
                gate.wait().await;

                if verdict.get() == Behaviour::StopPropagation {
                    break;
                }
            }
            dm.queue.complete_event(event_id);
        };
        self.drive_continuation(ServiceId::FRAMEWORK, ContinuationClass::Work, Box::pin(sweep));
        true
    }

    // -- internal event handling --------------------------------------------

    fn handle_insert(&self, service: ServiceId) {
        let dropped_pending = {
            let mut core = self.core.borrow_mut();
            let Some(host) = core.pending_installs.remove(&service) else {
                return;
            };
            if core.quitting {
                Some(host)
            } else {
                for hash in &host.provided {
                    core.interface_index.entry(*hash).or_default().insert(service);
                }
                core.services.insert(service, host);
                None
            }
        };
        if let Some(host) = dropped_pending {
            tracing::debug!(service = %service, name = host.info.name, "insert dropped, shutting down");
            return;
        }

        self.satisfy_from_active_providers(service);
        self.fire_dependency_requests(service);
        self.queue
            .push_kind(service, INTERNAL_EVENT_PRIORITY, EventKind::StartService(service));
    }

    /// Push a `DependencyRequestEvent` for every unsatisfied edge that has
    /// not been requested yet.
    fn fire_dependency_requests(&self, service: ServiceId) {
        let pending: Vec<InterfaceHash> = {
            let mut core = self.core.borrow_mut();
            let Some(host) = core.services.get_mut(&service) else {
                return;
            };
            host.unrequested_edges()
        };
        for interface in pending {
            self.queue.push_kind(
                service,
                INTERNAL_DEPENDENCY_EVENT_PRIORITY,
                EventKind::DependencyRequest {
                    requester: service,
                    interface,
                },
            );
        }
    }

    /// Deliver every active provider matching `consumer`'s declared edges.
    fn satisfy_from_active_providers(&self, consumer: ServiceId) {
        let edges: Vec<InterfaceHash> = {
            let core = self.core.borrow();
            let Some(host) = core.services.get(&consumer) else {
                return;
            };
            host.declared.iter().map(|dep| dep.interface).collect()
        };
        for interface in edges {
            let candidates: Vec<ServiceId> = {
                let core = self.core.borrow();
                core.interface_index
                    .get(&interface)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default()
            };
            for provider in candidates {
                self.try_deliver(provider, consumer, interface);
            }
        }
    }

    /// Deliver `provider`'s `interface` to `consumer` when the edge accepts
    /// it. Returns whether a delivery happened.
    fn try_deliver(
        &self,
        provider: ServiceId,
        consumer: ServiceId,
        interface: InterfaceHash,
    ) -> bool {
        if provider == consumer {
            return false;
        }
        let (provider_info, instance) = {
            let core = self.core.borrow();
            let Some(provider_host) = core.services.get(&provider) else {
                return false;
            };
            if !provider_host.state().is_active() {
                return false;
            }
            let Some(instance) = provider_host.interface_instance(interface) else {
                return false;
            };
            (provider_host.info.clone(), instance)
        };

        let accepted = {
            let core = self.core.borrow();
            let Some(consumer_host) = core.services.get(&consumer) else {
                return false;
            };
            let already = consumer_host
                .providers
                .get(&interface)
                .map(|set| set.contains(&provider))
                .unwrap_or(false);
            !already && consumer_host.matches_edge(interface, &provider_info.properties)
        };
        if !accepted {
            return false;
        }

        // The add callback runs user code; keep the registry unborrowed.
        let Some(mut consumer_host) = self.core.borrow_mut().services.remove(&consumer) else {
            return false;
        };
        consumer_host.deliver(interface, &provider_info, instance);
        self.core.borrow_mut().services.insert(consumer, consumer_host);

        if let Some(provider_host) = self.core.borrow_mut().services.get_mut(&provider) {
            provider_host.dependents.insert(consumer);
        }
        tracing::trace!(
            provider = %provider,
            consumer = %consumer,
            interface = %interface,
            "dependency delivered"
        );
        true
    }

    fn handle_start(&self, service: ServiceId) {
        if self.core.borrow().quitting {
            return;
        }
        let Some(state) = self.service_state(service) else {
            return;
        };
        match state {
            ServiceState::Installed => {
                if self
                    .transition(service, ServiceState::Injecting)
                    .is_err()
                {
                    return;
                }
                self.satisfy_from_active_providers(service);
                self.fire_dependency_requests(service);
            }
            ServiceState::Injecting => {}
            _ => return,
        }

        let satisfied = {
            let core = self.core.borrow();
            core.services
                .get(&service)
                .map(|host| host.all_required_satisfied())
                .unwrap_or(false)
        };
        if !satisfied {
            // Stays in Injecting; a DependencyOnlineEvent re-pushes start.
            return;
        }

        if self.transition(service, ServiceState::Starting).is_err() {
            return;
        }

        let start_future = {
            let core = self.core.borrow();
            core.services
                .get(&service)
                .and_then(|host| host.start_future())
        };
        match start_future {
            Some(future) => {
                let dm = self.clone();
                let wrapped = async move {
                    let outcome = AssertUnwindSafe(future).catch_unwind().await;
                    let result = match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            dm.core.borrow_mut().metrics.handler_panics += 1;
                            Err(StartError::new("panic in start"))
                        }
                    };
                    dm.finish_start(service, result);
                };
                self.drive_continuation(service, ContinuationClass::Lifecycle, Box::pin(wrapped));
            }
            None => {
                // Constructor-injected: build the instance, no user start.
                let ctx = {
                    let core = self.core.borrow();
                    core.services.get(&service).map(|host| {
                        ServiceContext::new(self.queue.clone(), service, host.info.priority)
                    })
                };
                if let Some(ctx) = ctx {
                    let removed = self.core.borrow_mut().services.remove(&service);
                    if let Some(mut host) = removed {
                        host.construct_injected(ctx);
                        self.core.borrow_mut().services.insert(service, host);
                    }
                }
                self.finish_start(service, Ok(()));
            }
        }
    }

    fn finish_start(&self, service: ServiceId, result: std::result::Result<(), StartError>) {
        match result {
            Ok(()) => {
                if self.transition(service, ServiceState::Active).is_err() {
                    return;
                }
                tracing::info!(service = %service, "service active");
                self.queue.push_kind(
                    service,
                    INTERNAL_DEPENDENCY_EVENT_PRIORITY,
                    EventKind::DependencyOnline { provider: service },
                );
            }
            Err(error) => {
                tracing::warn!(service = %service, %error, "service start failed");
                let _ = self.transition(service, ServiceState::Installed);
            }
        }

        let pending = {
            let mut core = self.core.borrow_mut();
            core.services
                .get_mut(&service)
                .and_then(|host| host.pending_stop.take())
        };
        if let Some(remove_after) = pending {
            self.queue.push_kind(
                service,
                INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                EventKind::StopService {
                    service,
                    remove_after,
                },
            );
        }
    }

    fn handle_dependency_online(&self, provider: ServiceId) {
        let provided: Vec<InterfaceHash> = {
            let core = self.core.borrow();
            let Some(host) = core.services.get(&provider) else {
                return;
            };
            if !host.state().is_active() {
                return;
            }
            host.provided.clone()
        };
        if provided.is_empty() {
            return;
        }

        let consumers: Vec<ServiceId> = {
            let core = self.core.borrow();
            let mut ids: Vec<ServiceId> = core.services.keys().copied().collect();
            ids.sort();
            ids
        };
        for consumer in consumers {
            if consumer == provider {
                continue;
            }
            let mut delivered = false;
            for interface in &provided {
                delivered |= self.try_deliver(provider, consumer, *interface);
            }
            if !delivered {
                continue;
            }
            let ready = {
                let core = self.core.borrow();
                core.services
                    .get(&consumer)
                    .map(|host| {
                        host.all_required_satisfied()
                            && matches!(
                                host.state(),
                                ServiceState::Installed | ServiceState::Injecting
                            )
                    })
                    .unwrap_or(false)
            };
            if ready {
                self.queue.push_kind(
                    consumer,
                    INTERNAL_EVENT_PRIORITY,
                    EventKind::StartService(consumer),
                );
            }
        }
    }

    fn handle_stop(&self, service: ServiceId, remove_after: bool) {
        let Some(state) = self.service_state(service) else {
            return;
        };
        match state {
            ServiceState::Active => {
                if self.transition(service, ServiceState::Stopping).is_err() {
                    return;
                }
                // Invalidation is immediate; in-flight work is discarded.
                self.invalidate_registrations(service);
                self.discard_continuations(service, false);
                self.queue.push_kind(
                    service,
                    INTERNAL_DEPENDENCY_EVENT_PRIORITY,
                    EventKind::DependencyOffline {
                        provider: service,
                        remove_after,
                    },
                );
            }
            ServiceState::Starting => {
                if let Some(host) = self.core.borrow_mut().services.get_mut(&service) {
                    host.pending_stop = Some(remove_after);
                }
            }
            ServiceState::Injecting => {
                let _ = self.transition(service, ServiceState::Installed);
                if remove_after {
                    self.queue.push_kind(
                        service,
                        INTERNAL_EVENT_PRIORITY,
                        EventKind::RemoveService(service),
                    );
                }
            }
            ServiceState::Installed => {
                if remove_after {
                    self.queue.push_kind(
                        service,
                        INTERNAL_EVENT_PRIORITY,
                        EventKind::RemoveService(service),
                    );
                }
            }
            ServiceState::Stopping | ServiceState::Uninjecting => {
                // Upgrade an in-flight stop to stop-and-remove.
                if remove_after {
                    if let Some(host) = self.core.borrow_mut().services.get_mut(&service) {
                        host.pending_stop = Some(true);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_dependency_offline(&self, provider: ServiceId, remove_after: bool) {
        let (provided, provider_info) = {
            let core = self.core.borrow();
            let Some(host) = core.services.get(&provider) else {
                return;
            };
            if host.state() != ServiceState::Stopping {
                return;
            }
            (host.provided.clone(), host.info.clone())
        };

        let dependents: Vec<ServiceId> = {
            let core = self.core.borrow();
            core.services
                .get(&provider)
                .map(|host| host.dependents.iter().copied().collect())
                .unwrap_or_default()
        };

        for dependent in dependents {
            self.withdraw_provider_from(provider, &provider_info, &provided, dependent);
        }

        let drained = {
            let core = self.core.borrow();
            core.services
                .get(&provider)
                .map(|host| host.dependents.is_empty())
                .unwrap_or(true)
        };
        if drained {
            self.begin_user_stop(provider, remove_after);
        } else {
            self.queue.push_kind(
                provider,
                INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                EventKind::ContinuableDependencyOffline {
                    provider,
                    remove_after,
                },
            );
        }
    }

    fn withdraw_provider_from(
        &self,
        provider: ServiceId,
        provider_info: &ServiceInfo,
        provided: &[InterfaceHash],
        dependent: ServiceId,
    ) {
        for interface in provided {
            let held = {
                let core = self.core.borrow();
                core.services
                    .get(&dependent)
                    .and_then(|host| host.providers.get(interface))
                    .map(|set| set.contains(&provider))
                    .unwrap_or(false)
            };
            if !held {
                continue;
            }

            let instance = {
                let core = self.core.borrow();
                core.services
                    .get(&provider)
                    .and_then(|host| host.interface_instance(*interface))
            };
            let Some(instance) = instance else {
                continue;
            };

            // The remove callback runs user code; keep the registry unborrowed.
            let Some(mut dependent_host) = self.core.borrow_mut().services.remove(&dependent)
            else {
                continue;
            };
            dependent_host.withdraw(*interface, provider_info, instance);
            let lost_required = dependent_host
                .declared
                .find(*interface)
                .map(|dep| dep.is_required() && dep.satisfied == 0)
                .unwrap_or(false);
            let dependent_state = dependent_host.state();
            let injected_constructed = dependent_host.is_constructed_injected();
            self.core
                .borrow_mut()
                .services
                .insert(dependent, dependent_host);

            if lost_required {
                // Try an alternative active provider first.
                let replaced = self.resatisfy_edge(dependent, *interface, provider);
                if !replaced
                    && matches!(
                        dependent_state,
                        ServiceState::Active | ServiceState::Starting
                    )
                {
                    self.queue.push_kind(
                        dependent,
                        INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                        EventKind::StopService {
                            service: dependent,
                            // An injected instance cannot outlive a
                            // constructor parameter.
                            remove_after: injected_constructed,
                        },
                    );
                }
            }
        }

        let still_held = {
            let core = self.core.borrow();
            core.services
                .get(&dependent)
                .map(|host| {
                    host.providers
                        .values()
                        .any(|set| set.contains(&provider))
                })
                .unwrap_or(false)
        };
        if !still_held {
            if let Some(provider_host) = self.core.borrow_mut().services.get_mut(&provider) {
                provider_host.dependents.remove(&dependent);
            }
        }
    }

    fn resatisfy_edge(
        &self,
        consumer: ServiceId,
        interface: InterfaceHash,
        leaving: ServiceId,
    ) -> bool {
        let candidates: Vec<ServiceId> = {
            let core = self.core.borrow();
            core.interface_index
                .get(&interface)
                .map(|set| set.iter().copied().filter(|id| *id != leaving).collect())
                .unwrap_or_default()
        };
        for candidate in candidates {
            if self.try_deliver(candidate, consumer, interface) {
                return true;
            }
        }
        false
    }

    fn handle_continuable_offline(&self, provider: ServiceId, remove_after: bool) {
        let Some(state) = self.service_state(provider) else {
            return;
        };
        if state != ServiceState::Stopping {
            return;
        }
        let drained = {
            let core = self.core.borrow();
            core.services
                .get(&provider)
                .map(|host| host.dependents.is_empty())
                .unwrap_or(true)
        };
        if drained {
            self.begin_user_stop(provider, remove_after);
        } else {
            self.queue.push_kind(
                provider,
                INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                EventKind::ContinuableDependencyOffline {
                    provider,
                    remove_after,
                },
            );
        }
    }

    fn begin_user_stop(&self, service: ServiceId, remove_after: bool) {
        let stop_future = {
            let core = self.core.borrow();
            core.services.get(&service).and_then(|host| host.stop_future())
        };
        match stop_future {
            Some(future) => {
                let dm = self.clone();
                let wrapped = async move {
                    if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                        dm.core.borrow_mut().metrics.handler_panics += 1;
                        tracing::error!(service = %service, "panic in stop");
                    }
                    dm.finish_stop(service, remove_after);
                };
                self.drive_continuation(service, ContinuationClass::Lifecycle, Box::pin(wrapped));
            }
            None => {
                if let Some(host) = self.core.borrow_mut().services.get_mut(&service) {
                    host.destroy_injected_instance();
                }
                self.finish_stop(service, remove_after);
            }
        }
    }

    fn finish_stop(&self, service: ServiceId, remove_after: bool) {
        if self.transition(service, ServiceState::Uninjecting).is_err() {
            return;
        }
        let _ = self.transition(service, ServiceState::Installed);
        let upgraded = {
            let mut core = self.core.borrow_mut();
            core.services
                .get_mut(&service)
                .and_then(|host| host.pending_stop.take())
                .unwrap_or(false)
        };
        let remove_after = remove_after || upgraded;

        // Destroyed injected instances release their resolved providers.
        let withdrawn_providers: Vec<ServiceId> = {
            let mut core = self.core.borrow_mut();
            match core.services.get_mut(&service) {
                Some(host) if !host.has_instance() => host.release_all_edges(),
                _ => Vec::new(),
            }
        };
        for provider in withdrawn_providers {
            if let Some(provider_host) = self.core.borrow_mut().services.get_mut(&provider) {
                provider_host.dependents.remove(&service);
            }
        }

        // Trackers undo per-requester work once the requester's stop is done.
        let edges: Vec<InterfaceHash> = {
            let core = self.core.borrow();
            core.services
                .get(&service)
                .map(|host| host.declared.iter().map(|dep| dep.interface).collect())
                .unwrap_or_default()
        };
        for interface in edges {
            self.queue.push_kind(
                service,
                INTERNAL_DEPENDENCY_EVENT_PRIORITY,
                EventKind::DependencyUndoRequest {
                    requester: service,
                    interface,
                },
            );
        }

        tracing::info!(service = %service, "service stopped");
        if remove_after {
            self.queue.push_kind(
                service,
                INTERNAL_EVENT_PRIORITY,
                EventKind::RemoveService(service),
            );
        }
    }

    fn handle_dependency_request(&self, requester: ServiceId, interface: InterfaceHash) {
        let trackers: Vec<Rc<TrackerFns>> = {
            let core = self.core.borrow();
            core.trackers
                .get(&interface)
                .map(|entries| entries.iter().map(|entry| Rc::clone(&entry.fns)).collect())
                .unwrap_or_default()
        };
        if trackers.is_empty() {
            return;
        }
        let properties = {
            let core = self.core.borrow();
            core.services
                .get(&requester)
                .map(|host| host.info.properties.clone())
                .unwrap_or_default()
        };
        let request = DependencyRequest {
            requester,
            interface,
            properties,
        };
        for fns in trackers {
            (fns.on_request)(self, &request);
        }
    }

    fn handle_dependency_undo(&self, requester: ServiceId, interface: InterfaceHash) {
        let trackers: Vec<Rc<TrackerFns>> = {
            let core = self.core.borrow();
            core.trackers
                .get(&interface)
                .map(|entries| entries.iter().map(|entry| Rc::clone(&entry.fns)).collect())
                .unwrap_or_default()
        };
        if trackers.is_empty() {
            return;
        }
        let properties = {
            let core = self.core.borrow();
            core.services
                .get(&requester)
                .map(|host| host.info.properties.clone())
                .unwrap_or_default()
        };
        let request = DependencyRequest {
            requester,
            interface,
            properties,
        };
        for fns in trackers {
            (fns.on_undo)(self, &request);
        }
    }

    fn handle_remove(&self, service: ServiceId) {
        let Some(state) = self.service_state(service) else {
            return;
        };
        match state {
            ServiceState::Installed => {}
            ServiceState::Uninstalled => return,
            _ => {
                // Still running; drive it down first and come back.
                self.queue.push_kind(
                    service,
                    INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                    EventKind::StopService {
                        service,
                        remove_after: true,
                    },
                );
                return;
            }
        }

        if self.transition(service, ServiceState::Uninstalling).is_err() {
            return;
        }
        let _ = self.transition(service, ServiceState::Uninstalled);

        let host = {
            let mut core = self.core.borrow_mut();
            let Some(host) = core.services.remove(&service) else {
                return;
            };
            for hash in &host.provided {
                if let Some(set) = core.interface_index.get_mut(hash) {
                    set.remove(&service);
                    if set.is_empty() {
                        core.interface_index.remove(hash);
                    }
                }
            }
            host
        };

        // Detach from providers' dependent sets.
        for providers in host.providers.values() {
            for provider in providers {
                if let Some(provider_host) = self.core.borrow_mut().services.get_mut(provider) {
                    provider_host.dependents.remove(&service);
                }
            }
        }

        self.invalidate_registrations(service);
        self.discard_continuations(service, true);

        // Undo for services removed without ever stopping (never started).
        for dep in host.declared.iter() {
            self.queue.push_kind(
                service,
                INTERNAL_DEPENDENCY_EVENT_PRIORITY,
                EventKind::DependencyUndoRequest {
                    requester: service,
                    interface: dep.interface,
                },
            );
        }

        tracing::info!(service = %service, name = host.info.name, "service uninstalled");
        drop(host);
    }

    fn handle_quit(&self) {
        self.queue.arm_quit_deadline();
        let (installed, pending): (Vec<ServiceId>, Vec<ServiceId>) = {
            let mut core = self.core.borrow_mut();
            if core.quitting {
                // Quit is idempotent; the teardown is already under way.
                return;
            }
            core.quitting = true;
            let pending: Vec<ServiceId> = core.pending_installs.keys().copied().collect();
            core.pending_installs.clear();
            let mut installed: Vec<ServiceId> = core.services.keys().copied().collect();
            installed.sort();
            (installed, pending)
        };
        tracing::info!(
            services = installed.len(),
            dropped_pending = pending.len(),
            "quit received, stopping all services"
        );
        for service in installed {
            self.queue.push_kind(
                service,
                INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
                EventKind::StopService {
                    service,
                    remove_after: true,
                },
            );
        }
    }

    // -- helpers ------------------------------------------------------------

    fn service_state(&self, service: ServiceId) -> Option<ServiceState> {
        self.core
            .borrow()
            .services
            .get(&service)
            .map(|host| host.state())
    }

    fn transition(&self, service: ServiceId, to: ServiceState) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let host = core
            .services
            .get_mut(&service)
            .ok_or_else(|| Error::not_found(format!("service {service}")))?;
        host.transition(to)
    }

    fn invalidate_registrations(&self, service: ServiceId) {
        let mut core = self.core.borrow_mut();
        for handlers in core.handlers.values_mut() {
            handlers.retain(|entry| entry.service != service);
        }
        core.handlers.retain(|_, handlers| !handlers.is_empty());
        core.interceptors.retain(|entry| entry.service != service);
        for trackers in core.trackers.values_mut() {
            trackers.retain(|entry| entry.service != service);
        }
        core.trackers.retain(|_, trackers| !trackers.is_empty());
    }

    fn remove_handler_entries(&self, service: ServiceId, event_type: EventTypeHash) {
        let mut core = self.core.borrow_mut();
        if let Some(handlers) = core.handlers.get_mut(&event_type) {
            handlers.retain(|entry| entry.service != service);
            if handlers.is_empty() {
                core.handlers.remove(&event_type);
            }
        }
    }

    fn remove_tracker_entries(&self, service: ServiceId, interface: InterfaceHash) {
        let mut core = self.core.borrow_mut();
        if let Some(trackers) = core.trackers.get_mut(&interface) {
            trackers.retain(|entry| entry.service != service);
            if trackers.is_empty() {
                core.trackers.remove(&interface);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_table_size(&self) -> usize {
        self.core.borrow().handlers.values().map(|v| v.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn interceptor_table_size(&self) -> usize {
        self.core.borrow().interceptors.len()
    }

    #[cfg(test)]
    pub(crate) fn tracker_table_size(&self) -> usize {
        self.core.borrow().trackers.values().map(|v| v.len()).sum()
    }
}

/// Run one handler as its own cancellable continuation. The guard resolves
/// the gate even when the continuation is discarded mid-flight, so the
/// dispatch sweep never deadlocks on a stopped service.
async fn handler_run(
    dm: DependencyManager,
    inner: LocalBoxFuture<'static, Behaviour>,
    verdict: Rc<Cell<Behaviour>>,
    gate: AsyncManualResetEvent,
) {
    struct GateGuard {
        gate: AsyncManualResetEvent,
    }

    impl Drop for GateGuard {
        fn drop(&mut self) {
            self.gate.set();
        }
    }

    let _guard = GateGuard { gate };
    match AssertUnwindSafe(inner).catch_unwind().await {
        Ok(behaviour) => verdict.set(behaviour),
        Err(_) => {
            dm.core.borrow_mut().metrics.handler_panics += 1;
            tracing::error!("panic in event handler isolated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyRegister;
    use crate::types::QueueConfig;

    struct Plain;

    impl AdvancedService for Plain {
        fn construct(
            _reg: &mut DependencyRegister<Self>,
            _props: &Properties,
            _ctx: ServiceContext,
        ) -> Self {
            Plain
        }
    }

    fn manager() -> DependencyManager {
        EventQueue::new(QueueConfig::default()).create_manager()
    }

    #[test]
    fn test_service_ids_start_at_one_and_increment() {
        let dm = manager();
        let a = dm
            .create_service_manager::<Plain>(Properties::new())
            .build()
            .unwrap();
        let b = dm
            .create_service_manager::<Plain>(Properties::new())
            .build()
            .unwrap();
        assert_eq!(a.id().as_u64(), 1);
        assert_eq!(b.id().as_u64(), 2);
        assert_ne!(a.gid(), b.gid());
    }

    #[test]
    fn test_insert_then_start_reaches_active() {
        let dm = manager();
        let proxy = dm
            .create_service_manager::<Plain>(Properties::new())
            .build()
            .unwrap();
        assert_eq!(
            dm.get_service_by_id(proxy.id()).unwrap().state,
            ServiceState::Installed
        );

        dm.run_until_idle();
        assert_eq!(
            dm.get_service_by_id(proxy.id()).unwrap().state,
            ServiceState::Active
        );
    }

    #[test]
    fn test_quit_stops_and_removes_everything() {
        let dm = manager();
        dm.create_service_manager::<Plain>(Properties::new())
            .build()
            .unwrap();
        dm.run_until_idle();
        assert_eq!(dm.service_count(), 1);

        dm.event_queue().quit();
        dm.run_until_idle();
        assert_eq!(dm.service_count(), 0);
    }

    #[test]
    fn test_get_service_by_id_unknown() {
        let dm = manager();
        assert!(dm.get_service_by_id(ServiceId::from_raw(999)).is_none());
    }

    #[test]
    fn test_registration_tokens_round_trip_tables() {
        let dm = manager();
        assert_eq!(dm.handler_table_size(), 0);

        let handler = dm.register_event_handler::<u32, _, _>(
            ServiceId::FRAMEWORK,
            None,
            |_event: Arc<u32>| async { Behaviour::Continue },
        );
        let interceptor =
            dm.register_global_interceptor(ServiceId::FRAMEWORK, |_| true, |_, _| {});
        let tracker = dm.register_dependency_tracker::<dyn Any>(
            ServiceId::FRAMEWORK,
            |_, _| {},
            |_, _| {},
        );
        assert_eq!(dm.handler_table_size(), 1);
        assert_eq!(dm.interceptor_table_size(), 1);
        assert_eq!(dm.tracker_table_size(), 1);

        drop(handler);
        drop(interceptor);
        drop(tracker);
        dm.run_until_idle();

        assert_eq!(dm.handler_table_size(), 0);
        assert_eq!(dm.interceptor_table_size(), 0);
        assert_eq!(dm.tracker_table_size(), 0);
    }

    #[test]
    fn test_thread_local_slot_set_during_run() {
        let dm = manager();
        assert!(get_thread_local_manager().is_none());

        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        dm.event_queue().push_kind(
            ServiceId::FRAMEWORK,
            INTERNAL_EVENT_PRIORITY,
            EventKind::RunFunction(crate::events::RunFunction::new(move |run_dm| {
                seen2.store(
                    get_thread_local_manager().map(|m| m.id()) == Some(run_dm.id()),
                    Ordering::SeqCst,
                );
            })),
        );
        dm.run_until_idle();
        assert!(seen.load(Ordering::SeqCst));
        assert!(get_thread_local_manager().is_none());
    }
}
