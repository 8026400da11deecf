//! Event dispatch integration tests: async handlers, interceptors,
//! propagation control, ordering, and coroutine cancellation.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use axon_core::dependency::DependencyRegister;
use axon_core::services::EventStatisticsService;
use axon_core::{
    AdvancedService, AsyncManualResetEvent, Behaviour, EventQueue, Properties, QueueConfig,
    ServiceContext, ServiceId, TaskCancelled, INTERNAL_EVENT_PRIORITY,
};

fn queue() -> EventQueue {
    EventQueue::new_ordered(QueueConfig {
        quit_timeout: Duration::from_millis(500),
        wait_interval: Duration::from_millis(5),
        spinlock: false,
    })
}

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

fn active_service(dm: &axon_core::DependencyManager) -> ServiceId {
    let proxy = dm
        .create_service_manager::<Plain>(Properties::new())
        .build()
        .unwrap();
    dm.run_until_idle();
    proxy.id()
}

#[derive(Debug)]
struct DoWorkEvent;

#[derive(Debug)]
struct PingEvent {
    seq: u64,
}

// ---------------------------------------------------------------------------
// S3: a handler suspended on an awaitable completes only after set()
// ---------------------------------------------------------------------------

#[test]
fn suspended_handler_resumes_after_set() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let gate = AsyncManualResetEvent::new();
    let counter = Rc::new(Cell::new(0u32));

    let handler_gate = gate.clone();
    let handler_counter = Rc::clone(&counter);
    let _registration = dm.register_event_handler::<DoWorkEvent, _, _>(
        service,
        None,
        move |_event: Arc<DoWorkEvent>| {
            let gate = handler_gate.clone();
            let counter = Rc::clone(&handler_counter);
            async move {
                gate.wait().await;
                counter.set(counter.get() + 1);
                Behaviour::Continue
            }
        },
    );

    let completion = queue.push_prioritised_event_async(service, 100, DoWorkEvent);
    dm.run_until_idle();

    // Handler is parked on the event; nothing has completed.
    assert_eq!(counter.get(), 0);
    assert!(!completion.is_complete());

    gate.set();
    dm.run_until_idle();

    assert_eq!(counter.get(), 1);
    assert!(completion.is_complete());
}

// ---------------------------------------------------------------------------
// S6: a suppressing interceptor hides the event from handlers
// ---------------------------------------------------------------------------

#[test]
fn interceptor_suppression_skips_handlers_and_reports_unprocessed() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let handled = Rc::new(Cell::new(false));
    let handler_handled = Rc::clone(&handled);
    let _handler = dm.register_event_handler::<DoWorkEvent, _, _>(
        service,
        None,
        move |_event: Arc<DoWorkEvent>| {
            let handled = Rc::clone(&handler_handled);
            async move {
                handled.set(true);
                Behaviour::Continue
            }
        },
    );

    let post_calls = Rc::new(Cell::new(0u32));
    let post_processed = Rc::new(Cell::new(true));
    let post_calls_in = Rc::clone(&post_calls);
    let post_processed_in = Rc::clone(&post_processed);
    let _interceptor = dm.register_event_interceptor::<DoWorkEvent>(
        service,
        |_view| false,
        move |_view, processed| {
            post_calls_in.set(post_calls_in.get() + 1);
            post_processed_in.set(processed);
        },
    );

    queue.push_event(service, DoWorkEvent);
    dm.run_until_idle();

    assert!(!handled.get());
    assert_eq!(post_calls.get(), 1);
    assert!(!post_processed.get());
    assert_eq!(dm.metrics().events_suppressed, 1);
}

// ---------------------------------------------------------------------------
// Handler propagation and registration-order dispatch
// ---------------------------------------------------------------------------

#[test]
fn stop_propagation_hides_event_from_later_handlers() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let first_order = Rc::clone(&order);
    let _first = dm.register_event_handler::<PingEvent, _, _>(
        service,
        None,
        move |_event: Arc<PingEvent>| {
            let order = Rc::clone(&first_order);
            async move {
                order.borrow_mut().push("first");
                Behaviour::StopPropagation
            }
        },
    );
    let second_order = Rc::clone(&order);
    let _second = dm.register_event_handler::<PingEvent, _, _>(
        service,
        None,
        move |_event: Arc<PingEvent>| {
            let order = Rc::clone(&second_order);
            async move {
                order.borrow_mut().push("second");
                Behaviour::Continue
            }
        },
    );

    queue.push_event(service, PingEvent { seq: 1 });
    dm.run_until_idle();

    assert_eq!(*order.borrow(), vec!["first"]);
}

#[test]
fn handler_filter_restricts_to_origin() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);
    let other = active_service(&dm);

    let count = Rc::new(Cell::new(0u32));
    let handler_count = Rc::clone(&count);
    let _registration = dm.register_event_handler::<PingEvent, _, _>(
        service,
        Some(other),
        move |_event: Arc<PingEvent>| {
            let count = Rc::clone(&handler_count);
            async move {
                count.set(count.get() + 1);
                Behaviour::Continue
            }
        },
    );

    queue.push_event(service, PingEvent { seq: 1 });
    queue.push_event(other, PingEvent { seq: 2 });
    dm.run_until_idle();

    // Only the event originating from `other` is dispatched.
    assert_eq!(count.get(), 1);
}

// ---------------------------------------------------------------------------
// Registration round-trip: dropping a token restores the tables
// ---------------------------------------------------------------------------

trait Resource {}

#[test]
fn dropping_registrations_restores_tables() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let handler = dm.register_event_handler::<PingEvent, _, _>(
        service,
        None,
        |_event: Arc<PingEvent>| async move { Behaviour::Continue },
    );
    let interceptor =
        dm.register_event_interceptor::<PingEvent>(service, |_| true, |_, _| {});
    let tracker =
        dm.register_dependency_tracker::<dyn Resource>(service, |_, _| {}, |_, _| {});

    drop(handler);
    drop(interceptor);
    drop(tracker);
    dm.run_until_idle();

    // Suspended state is unobservable: a fresh ping reaches no handler.
    let completion = queue.push_prioritised_event_async(service, 1000, PingEvent { seq: 9 });
    dm.run_until_idle();
    assert!(completion.is_complete());
    assert_eq!(dm.metrics().handlers_invoked, 0);
}

// ---------------------------------------------------------------------------
// Ordering: priority zero preempts, stop yields to start within a tick
// ---------------------------------------------------------------------------

#[test]
fn priority_zero_is_delivered_first() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
    let handler_seen = Rc::clone(&seen);
    let _registration = dm.register_event_handler::<PingEvent, _, _>(
        service,
        None,
        move |event: Arc<PingEvent>| {
            let seen = Rc::clone(&handler_seen);
            async move {
                seen.borrow_mut().push(event.seq);
                Behaviour::Continue
            }
        },
    );

    queue.push_prioritised_event(service, INTERNAL_EVENT_PRIORITY, PingEvent { seq: 1 });
    queue.push_prioritised_event(service, 0, PingEvent { seq: 2 });
    queue.push_prioritised_event(service, INTERNAL_EVENT_PRIORITY, PingEvent { seq: 3 });
    dm.run_until_idle();

    assert_eq!(*seen.borrow(), vec![2, 1, 3]);
}

#[test]
fn stop_requeues_after_start_within_iteration() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let interceptor_order = Rc::clone(&order);
    let _interceptor = dm.register_global_interceptor(
        service,
        move |view| {
            if view.name == "StartServiceEvent" || view.name == "StopServiceEvent" {
                interceptor_order.borrow_mut().push(view.name);
            }
            true
        },
        |_, _| {},
    );

    // Stop is pushed before start, but start's priority (1000) beats the
    // stop requeue priority (1011).
    queue.push_stop_service(service, false);
    queue.push_start_service(service);
    dm.run_until_idle();

    assert_eq!(
        *order.borrow(),
        vec!["StartServiceEvent", "StopServiceEvent"]
    );
}

// ---------------------------------------------------------------------------
// Cancellation: coroutines owned by a stopped service are discarded
// ---------------------------------------------------------------------------

#[test]
fn stopping_a_service_cancels_its_task() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let gate = AsyncManualResetEvent::new();
    let task_gate = gate.clone();
    let task = dm.spawn_task(service, async move {
        task_gate.wait().await;
        42u32
    });
    dm.run_until_idle();
    assert!(!task.is_finished());

    queue.push_stop_service(service, false);
    dm.run_until_idle();

    // The continuation was dropped; the awaiter observes cancellation.
    assert!(task.is_finished());
    assert_eq!(futures::executor::block_on(task), Err(TaskCancelled));
    assert!(dm.metrics().continuations_discarded >= 1);

    // A late wake-up of the dropped continuation is also just discarded.
    gate.set();
    dm.run_until_idle();
}

#[test]
fn suspended_handler_of_stopped_service_does_not_block_completion() {
    let queue = queue();
    let dm = queue.create_manager();
    let service = active_service(&dm);

    let gate = AsyncManualResetEvent::new();
    let handler_gate = gate.clone();
    let _registration = dm.register_event_handler::<DoWorkEvent, _, _>(
        service,
        None,
        move |_event: Arc<DoWorkEvent>| {
            let gate = handler_gate.clone();
            async move {
                gate.wait().await;
                Behaviour::Continue
            }
        },
    );

    let completion = queue.push_prioritised_event_async(service, 1000, DoWorkEvent);
    dm.run_until_idle();
    assert!(!completion.is_complete());

    queue.push_stop_service(service, false);
    dm.run_until_idle();

    // The handler's continuation was discarded, so the event resolves.
    assert!(completion.is_complete());
}

// ---------------------------------------------------------------------------
// S8: event statistics observe processing and suppression
// ---------------------------------------------------------------------------

#[test]
fn statistics_service_observes_events() {
    use axon_core::services::EventStatisticsSource;

    let queue = queue();
    let dm = queue.create_manager();
    let stats = dm
        .create_service_manager::<EventStatisticsService>(Properties::new())
        .provides::<dyn axon_core::services::EventStatisticsSource>()
        .build()
        .unwrap();
    let service = active_service(&dm);

    let _registration = dm.register_event_handler::<PingEvent, _, _>(
        service,
        None,
        |_event: Arc<PingEvent>| async move { Behaviour::Continue },
    );
    queue.push_event(service, PingEvent { seq: 1 });
    queue.push_event(service, PingEvent { seq: 2 });
    dm.run_until_idle();

    let snapshot = stats.get().unwrap().borrow().snapshot();
    let ping = snapshot
        .iter()
        .find(|s| s.name.contains("PingEvent"))
        .expect("ping stats recorded");
    assert_eq!(ping.occurrences, 2);
    assert_eq!(ping.handled, 2);
    assert_eq!(ping.suppressed, 0);

    // Internal lifecycle traffic was observed too.
    assert!(snapshot.iter().any(|s| s.name == "StartServiceEvent"));
}
