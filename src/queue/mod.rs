//! Priority-ordered event queue.
//!
//! Multi-producer, single-consumer. Producers on any thread push prioritized
//! events; the loop thread drains them in priority order (lower value first).
//! Two disciplines exist: the default binary-heap store does not guarantee
//! FIFO within a priority level, the ordered store tiebreaks on event id for
//! full determinism.
//!
//! Shutdown: the first `quit()` (or a captured SIGINT) injects exactly one
//! `QuitEvent` and arms a drain deadline; a second `quit()` or deadline
//! expiry forces the loop to terminate with events still pending.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{BinaryHeap, BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::coroutines::{AsyncManualResetEvent, ManualResetWait};
use crate::events::{
    Event, EventKind, RunFunction, UserPayload, INTERNAL_EVENT_PRIORITY,
    INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
};
use crate::types::{Config, EventId, QueueConfig, ServiceId};

// ---------------------------------------------------------------------------
// SIGINT capture
// ---------------------------------------------------------------------------

static SIGINT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static SIGINT_INSTALLED: AtomicBool = AtomicBool::new(false);

fn sigint_flag() -> &'static Arc<AtomicBool> {
    SIGINT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Install the process-wide SIGINT handler at most once.
pub(crate) fn install_sigint_handler() -> std::io::Result<()> {
    if !SIGINT_INSTALLED.swap(true, Ordering::SeqCst) {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(sigint_flag()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pending store disciplines
// ---------------------------------------------------------------------------

/// Heap entry ordered by priority alone; equal priorities pop in arbitrary
/// order, which is measurably faster than full ordering.
struct HeapEntry(Event);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap, so reverse for lowest-priority-first.
        other.0.priority.cmp(&self.0.priority)
    }
}

enum PendingStore {
    Heap(BinaryHeap<HeapEntry>),
    Ordered(BTreeMap<(u64, u64), Event>),
}

impl PendingStore {
    fn insert(&mut self, event: Event) {
        match self {
            PendingStore::Heap(heap) => heap.push(HeapEntry(event)),
            PendingStore::Ordered(map) => {
                map.insert((event.priority, event.id.as_u64()), event);
            }
        }
    }

    fn pop(&mut self) -> Option<Event> {
        match self {
            PendingStore::Heap(heap) => heap.pop().map(|entry| entry.0),
            PendingStore::Ordered(map) => map.pop_first().map(|(_, event)| event),
        }
    }

    fn len(&self) -> usize {
        match self {
            PendingStore::Heap(heap) => heap.len(),
            PendingStore::Ordered(map) => map.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueState {
    store: PendingStore,
    quit_sent_at: Option<Instant>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    next_event_id: AtomicU64,
    running: AtomicBool,
    terminated: AtomicBool,
    completions: Mutex<HashMap<EventId, AsyncManualResetEvent>>,
    config: QueueConfig,
}

enum PopOutcome {
    Got(Event),
    Empty,
    Terminated,
}

/// Thread-safe handle to one event loop's queue. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<QueueShared>,
}

impl EventQueue {
    /// Binary-heap discipline: priority-ordered, FIFO within a priority
    /// level not guaranteed.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_store(config, PendingStore::Heap(BinaryHeap::new()))
    }

    /// Fully deterministic discipline: ties within a priority level break on
    /// event id (insertion order).
    pub fn new_ordered(config: QueueConfig) -> Self {
        Self::with_store(config, PendingStore::Ordered(BTreeMap::new()))
    }

    /// Build a queue from the aggregate runtime configuration, initializing
    /// tracing from its observability section first. Uses the default
    /// (heap) discipline.
    pub fn from_config(config: &Config) -> Self {
        crate::observability::init_tracing(&config.observability);
        Self::new(config.queue.clone())
    }

    fn with_store(config: QueueConfig, store: PendingStore) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    store,
                    quit_sent_at: None,
                }),
                wakeup: Condvar::new(),
                next_event_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                completions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    // -- producer API -------------------------------------------------------

    /// Push a user event at the default internal priority.
    pub fn push_event<E: Any + Send + Sync>(&self, origin: ServiceId, payload: E) -> EventId {
        self.push_prioritised_event(origin, INTERNAL_EVENT_PRIORITY, payload)
    }

    /// Push a user event at an explicit priority (lower fires earlier).
    pub fn push_prioritised_event<E: Any + Send + Sync>(
        &self,
        origin: ServiceId,
        priority: u64,
        payload: E,
    ) -> EventId {
        self.push_kind(origin, priority, EventKind::User(UserPayload::new(payload)))
    }

    /// Push a user event and obtain a completion that resolves once every
    /// handler for it has finished, including suspended ones.
    pub fn push_prioritised_event_async<E: Any + Send + Sync>(
        &self,
        origin: ServiceId,
        priority: u64,
        payload: E,
    ) -> EventCompletion {
        let id = self.allocate_event_id();
        let gate = AsyncManualResetEvent::new();
        self.shared.completions.lock().insert(id, gate.clone());
        self.insert(Event {
            id,
            origin,
            priority,
            kind: EventKind::User(UserPayload::new(payload)),
        });
        EventCompletion { id, gate }
    }

    /// Request that a service be driven towards `Active` (initial start or
    /// retry after a start failure).
    pub fn push_start_service(&self, service: ServiceId) -> EventId {
        self.push_kind(
            service,
            INTERNAL_EVENT_PRIORITY,
            EventKind::StartService(service),
        )
    }

    /// Request that a service leave `Active`; with `remove_after` it is also
    /// uninstalled once its stop completes.
    pub fn push_stop_service(&self, service: ServiceId, remove_after: bool) -> EventId {
        self.push_kind(
            service,
            INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
            EventKind::StopService {
                service,
                remove_after,
            },
        )
    }

    /// Request removal of an installed service.
    pub fn push_remove_service(&self, service: ServiceId) -> EventId {
        self.push_kind(
            service,
            INTERNAL_EVENT_PRIORITY,
            EventKind::RemoveService(service),
        )
    }

    /// Run a closure on the loop thread with access to the manager.
    pub fn push_run_function(
        &self,
        origin: ServiceId,
        function: impl FnOnce(&crate::manager::DependencyManager) + Send + 'static,
    ) -> EventId {
        self.push_kind(
            origin,
            INTERNAL_EVENT_PRIORITY,
            EventKind::RunFunction(RunFunction::new(function)),
        )
    }

    pub(crate) fn push_kind(&self, origin: ServiceId, priority: u64, kind: EventKind) -> EventId {
        let id = self.allocate_event_id();
        self.insert(Event {
            id,
            origin,
            priority,
            kind,
        });
        id
    }

    /// Request shutdown. The first call injects a single `QuitEvent` and
    /// arms the drain deadline; subsequent calls force termination.
    pub fn quit(&self) {
        let mut state = self.shared.state.lock();
        if state.quit_sent_at.is_none() {
            self.inject_quit_locked(&mut state);
        } else {
            self.shared.terminated.store(true, Ordering::Release);
        }
        drop(state);
        self.shared.wakeup.notify_all();
    }

    pub fn size(&self) -> u64 {
        self.shared.state.lock().store.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // -- consumer API (crate-internal) --------------------------------------

    fn allocate_event_id(&self) -> EventId {
        EventId::from_raw(self.shared.next_event_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, event: Event) {
        {
            let mut state = self.shared.state.lock();
            state.store.insert(event);
        }
        self.shared.wakeup.notify_all();
    }

    fn inject_quit_locked(&self, state: &mut QueueState) {
        let id = self.allocate_event_id();
        state.store.insert(Event {
            id,
            origin: ServiceId::FRAMEWORK,
            priority: INTERNAL_EVENT_PRIORITY,
            kind: EventKind::Quit,
        });
        state.quit_sent_at = Some(Instant::now());
        tracing::debug!(event_id = %id, "quit event injected");
    }

    /// Arm the drain deadline without injecting another quit event. Used
    /// when a `QuitEvent` arrives through a path other than `quit()`
    /// (broadcast from a sibling manager).
    pub(crate) fn arm_quit_deadline(&self) {
        let mut state = self.shared.state.lock();
        if state.quit_sent_at.is_none() {
            state.quit_sent_at = Some(Instant::now());
        }
    }

    /// Force the loop to exit regardless of pending events.
    pub(crate) fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
    }

    pub(crate) fn mark_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Release);
    }

    fn evaluate_quit_locked(&self, state: &mut QueueState) {
        if sigint_flag().load(Ordering::Acquire) && state.quit_sent_at.is_none() {
            tracing::info!("sigint observed, beginning shutdown");
            self.inject_quit_locked(state);
        }
        if let Some(sent_at) = state.quit_sent_at {
            if sent_at.elapsed() >= self.shared.config.quit_timeout {
                tracing::warn!(
                    pending = state.store.len(),
                    "quit timeout elapsed, forcing termination"
                );
                self.shared.terminated.store(true, Ordering::Release);
            }
        }
    }

    fn poll_once(&self) -> PopOutcome {
        let mut state = self.shared.state.lock();
        self.evaluate_quit_locked(&mut state);
        if self.shared.terminated.load(Ordering::Acquire) {
            return PopOutcome::Terminated;
        }
        match state.store.pop() {
            Some(event) => PopOutcome::Got(event),
            None => PopOutcome::Empty,
        }
    }

    /// Pop the next event, waiting if the queue is empty. Returns `None`
    /// when the loop must terminate.
    pub(crate) fn blocking_pop(&self) -> Option<Event> {
        loop {
            match self.poll_once() {
                PopOutcome::Got(event) => return Some(event),
                PopOutcome::Terminated => return None,
                PopOutcome::Empty => {}
            }

            if self.shared.config.spinlock {
                let deadline = Instant::now() + QueueConfig::SPIN_BUDGET;
                while Instant::now() < deadline {
                    match self.poll_once() {
                        PopOutcome::Got(event) => return Some(event),
                        PopOutcome::Terminated => return None,
                        PopOutcome::Empty => std::hint::spin_loop(),
                    }
                }
            }

            let mut state = self.shared.state.lock();
            self.evaluate_quit_locked(&mut state);
            if self.shared.terminated.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = state.store.pop() {
                return Some(event);
            }
            self.shared
                .wakeup
                .wait_for(&mut state, self.shared.config.wait_interval);
        }
    }

    /// Non-blocking pop for manual pumping; does not evaluate quit state.
    pub(crate) fn try_pop(&self) -> Option<Event> {
        self.shared.state.lock().store.pop()
    }

    /// Resolve the completion gate of a fully-processed event, if any.
    pub(crate) fn complete_event(&self, id: EventId) {
        if let Some(gate) = self.shared.completions.lock().remove(&id) {
            gate.set();
        }
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("size", &self.size())
            .field("running", &self.is_running())
            .field(
                "terminated",
                &self.shared.terminated.load(Ordering::Acquire),
            )
            .finish()
    }
}

/// Completion handle returned by [`EventQueue::push_prioritised_event_async`].
///
/// Resolves once the event has been fully processed: all handlers finished,
/// including ones that suspended.
#[derive(Debug, Clone)]
pub struct EventCompletion {
    id: EventId,
    gate: AsyncManualResetEvent,
}

impl EventCompletion {
    pub fn event_id(&self) -> EventId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        self.gate.is_set()
    }

    /// Wait for the event to be fully processed.
    pub fn wait(&self) -> ManualResetWait {
        self.gate.wait()
    }
}
