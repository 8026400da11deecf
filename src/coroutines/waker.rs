//! Wakers that resume suspended coroutines through the event queue.

use std::sync::Arc;
use std::task::{Wake, Waker};

use crate::events::{EventKind, INTERNAL_COROUTINE_EVENT_PRIORITY};
use crate::queue::EventQueue;
use crate::types::{PromiseId, ServiceId};

/// The continuation class decides which resume event is pushed and which
/// cancellation rule applies in the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContinuationClass {
    /// Lifecycle start/stop coroutines; run for as long as the service exists.
    Lifecycle,
    /// Handler sweeps and spawned tasks; discarded once the owner leaves
    /// `Active`.
    Work,
}

struct ContinuationWaker {
    queue: EventQueue,
    promise: PromiseId,
    origin: ServiceId,
    class: ContinuationClass,
}

impl Wake for ContinuationWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let kind = match self.class {
            ContinuationClass::Lifecycle => EventKind::ContinuableStart(self.promise),
            ContinuationClass::Work => EventKind::Continuable(self.promise),
        };
        self.queue
            .push_kind(self.origin, INTERNAL_COROUTINE_EVENT_PRIORITY, kind);
    }
}

/// Build a waker that schedules a `ContinuableEvent` for `promise` at the
/// coroutine priority when woken.
pub(crate) fn continuation_waker(
    queue: EventQueue,
    promise: PromiseId,
    origin: ServiceId,
    class: ContinuationClass,
) -> Waker {
    Waker::from(Arc::new(ContinuationWaker {
        queue,
        promise,
        origin,
        class,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueConfig;

    #[test]
    fn test_wake_pushes_continuable_event() {
        let queue = EventQueue::new(QueueConfig::default());
        let waker = continuation_waker(
            queue.clone(),
            PromiseId::from_raw(9),
            ServiceId::from_raw(3),
            ContinuationClass::Work,
        );

        waker.wake_by_ref();
        waker.wake();

        // Every wake schedules one resume event.
        assert_eq!(queue.size(), 2);
        let event = queue.try_pop().unwrap();
        assert_eq!(event.priority, INTERNAL_COROUTINE_EVENT_PRIORITY);
        assert!(matches!(
            event.kind,
            EventKind::Continuable(p) if p == PromiseId::from_raw(9)
        ));
    }

    #[test]
    fn test_lifecycle_class_uses_start_variant() {
        let queue = EventQueue::new(QueueConfig::default());
        let waker = continuation_waker(
            queue.clone(),
            PromiseId::from_raw(1),
            ServiceId::from_raw(2),
            ContinuationClass::Lifecycle,
        );
        waker.wake();
        assert!(matches!(
            queue.try_pop().unwrap().kind,
            EventKind::ContinuableStart(_)
        ));
    }
}
