//! Single-threaded async mutex with deterministic FIFO hand-off.

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};

struct LockState {
    // Ticket lock: strict FIFO over pending lockers.
    next_ticket: u64,
    now_serving: u64,
    waiters: Vec<(u64, Waker)>,
    abandoned: Vec<u64>,
}

struct Shared<T> {
    state: RefCell<LockState>,
    value: RefCell<T>,
}

/// Asynchronous mutex for state shared between coroutines on one event loop.
///
/// Acquisitions resolve in request order. All operations must happen on the
/// thread the mutex was created on (checked in debug builds); the type is
/// deliberately `!Send`.
pub struct AsyncSingleThreadedMutex<T> {
    shared: Rc<Shared<T>>,
    created_on: ThreadId,
}

impl<T> AsyncSingleThreadedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(LockState {
                    next_ticket: 0,
                    now_serving: 0,
                    waiters: Vec::new(),
                    abandoned: Vec::new(),
                }),
                value: RefCell::new(value),
            }),
            created_on: thread::current().id(),
        }
    }

    /// Acquire the lock; resolves when every earlier acquisition released.
    pub fn lock(&self) -> MutexLockFuture<T> {
        debug_assert_eq!(
            thread::current().id(),
            self.created_on,
            "AsyncSingleThreadedMutex used from a foreign thread"
        );
        let ticket = {
            let mut state = self.shared.state.borrow_mut();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };
        MutexLockFuture {
            shared: Rc::clone(&self.shared),
            created_on: self.created_on,
            ticket,
            acquired: false,
        }
    }
}

impl<T: Default> Default for AsyncSingleThreadedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for AsyncSingleThreadedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("AsyncSingleThreadedMutex")
            .field("now_serving", &state.now_serving)
            .field("pending", &(state.next_ticket - state.now_serving))
            .finish()
    }
}

/// Future returned by [`AsyncSingleThreadedMutex::lock`].
pub struct MutexLockFuture<T> {
    shared: Rc<Shared<T>>,
    created_on: ThreadId,
    ticket: u64,
    acquired: bool,
}

impl<T> Future for MutexLockFuture<T> {
    type Output = AsyncMutexGuard<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        debug_assert_eq!(
            thread::current().id(),
            self.created_on,
            "AsyncSingleThreadedMutex polled from a foreign thread"
        );
        let mut state = self.shared.state.borrow_mut();
        if state.now_serving == self.ticket {
            drop(state);
            self.acquired = true;
            return Poll::Ready(AsyncMutexGuard {
                shared: Rc::clone(&self.shared),
            });
        }
        match state.waiters.iter_mut().find(|(t, _)| *t == self.ticket) {
            Some((_, waker)) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => state.waiters.push((self.ticket, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl<T> Drop for MutexLockFuture<T> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        // An abandoned locker must not stall the queue behind its ticket.
        let mut state = self.shared.state.borrow_mut();
        state.waiters.retain(|(t, _)| *t != self.ticket);
        if state.now_serving == self.ticket {
            advance(&mut state);
        } else {
            state.abandoned.push(self.ticket);
        }
    }
}

impl<T> fmt::Debug for MutexLockFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexLockFuture")
            .field("ticket", &self.ticket)
            .finish()
    }
}

fn advance(state: &mut LockState) {
    state.now_serving += 1;
    while let Some(pos) = state
        .abandoned
        .iter()
        .position(|t| *t == state.now_serving)
    {
        state.abandoned.swap_remove(pos);
        state.now_serving += 1;
    }
    let serving = state.now_serving;
    if let Some(pos) = state.waiters.iter().position(|(t, _)| *t == serving) {
        let (_, waker) = state.waiters.remove(pos);
        waker.wake();
    }
}

/// Lock guard; releasing (dropping) hands the mutex to the next ticket.
pub struct AsyncMutexGuard<T> {
    shared: Rc<Shared<T>>,
}

impl<T> AsyncMutexGuard<T> {
    /// Borrow the protected value.
    ///
    /// The borrow must not be held across a suspension point.
    pub fn get(&self) -> RefMut<'_, T> {
        self.shared.value.borrow_mut()
    }
}

impl<T> Drop for AsyncMutexGuard<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.borrow_mut();
        advance(&mut state);
    }
}

impl<T> fmt::Debug for AsyncMutexGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncMutexGuard")
    }
}
