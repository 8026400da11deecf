//! Eager-start single-value awaitable.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::types::TaskCancelled;

struct TaskState<T> {
    result: Option<Result<T, TaskCancelled>>,
    waker: Option<Waker>,
}

/// Handle to a unit of work spawned with
/// [`DependencyManager::spawn_task`](crate::manager::DependencyManager::spawn_task).
///
/// The work starts eagerly (it is polled once at spawn). Awaiting the task
/// yields its value, or `Err(TaskCancelled)` when the owning service stopped
/// before the work completed.
pub struct Task<T> {
    shared: Rc<RefCell<TaskState<T>>>,
}

impl<T> Task<T> {
    pub(crate) fn new_pair() -> (Task<T>, TaskCompletion<T>) {
        let shared = Rc::new(RefCell::new(TaskState {
            result: None,
            waker: None,
        }));
        (
            Task {
                shared: Rc::clone(&shared),
            },
            TaskCompletion {
                shared,
                completed: false,
            },
        )
    }

    /// Whether the task has produced a value or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.shared.borrow().result.is_some()
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskCancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.borrow_mut();
        match state.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Completion side held inside the spawned future. Dropping it without
/// completing (the owning service stopped and its continuation was discarded)
/// surfaces `TaskCancelled` to the awaiter.
pub(crate) struct TaskCompletion<T> {
    shared: Rc<RefCell<TaskState<T>>>,
    completed: bool,
}

impl<T> TaskCompletion<T> {
    pub(crate) fn complete(mut self, value: T) {
        self.completed = true;
        let waker = {
            let mut state = self.shared.borrow_mut();
            state.result = Some(Ok(value));
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for TaskCompletion<T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let waker = {
            let mut state = self.shared.borrow_mut();
            if state.result.is_none() {
                state.result = Some(Err(TaskCancelled));
            }
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> fmt::Debug for TaskCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletion")
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_task_completes_and_wakes() {
        let (task, completion) = Task::<u32>::new_pair();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        let mut task = pin!(task);
        assert!(task
            .as_mut()
            .poll(&mut Context::from_waker(&waker))
            .is_pending());

        completion.complete(99);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            task.as_mut().poll(&mut Context::from_waker(&waker)),
            Poll::Ready(Ok(99))
        );
    }

    #[test]
    fn test_dropped_completion_surfaces_cancellation() {
        let (task, completion) = Task::<u32>::new_pair();
        drop(completion);

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut task = pin!(task);
        assert_eq!(
            task.as_mut().poll(&mut Context::from_waker(&waker)),
            Poll::Ready(Err(TaskCancelled))
        );
    }

    #[test]
    fn test_is_finished() {
        let (task, completion) = Task::<&'static str>::new_pair();
        assert!(!task.is_finished());
        completion.complete("done");
        assert!(task.is_finished());
    }
}
