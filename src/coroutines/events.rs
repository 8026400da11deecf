//! Awaitable event primitives.
//!
//! Both primitives are thread-safe: `set()` may be called from any thread and
//! wakes waiters by scheduling their continuations back through the event
//! queue of whichever loop they are suspended on.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

// ---------------------------------------------------------------------------
// AsyncManualResetEvent
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManualResetState {
    set: bool,
    wakers: Vec<Waker>,
}

/// Multi-awaiter event that stays set until explicitly reset.
///
/// `set()` resumes every waiter; waiters arriving while the event is set
/// complete without suspending.
#[derive(Clone, Default)]
pub struct AsyncManualResetEvent {
    inner: Arc<Mutex<ManualResetState>>,
}

impl AsyncManualResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and resume every pending waiter.
    pub fn set(&self) {
        let wakers = {
            let mut state = self.inner.lock();
            state.set = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Return the event to the 'not set' state.
    pub fn reset(&self) {
        self.inner.lock().set = false;
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Wait until the event is set.
    pub fn wait(&self) -> ManualResetWait {
        ManualResetWait {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for AsyncManualResetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AsyncManualResetEvent")
            .field("set", &state.set)
            .field("waiters", &state.wakers.len())
            .finish()
    }
}

/// Future returned by [`AsyncManualResetEvent::wait`].
#[derive(Debug)]
pub struct ManualResetWait {
    inner: Arc<Mutex<ManualResetState>>,
}

impl fmt::Debug for ManualResetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualResetState")
            .field("set", &self.set)
            .finish()
    }
}

impl Future for ManualResetWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.inner.lock();
        if state.set {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// AsyncAutoResetEvent
// ---------------------------------------------------------------------------

struct AutoResetState {
    set: bool,
    next_waiter: u64,
    waiters: VecDeque<(u64, Waker)>,
}

impl Default for AutoResetState {
    fn default() -> Self {
        Self {
            set: false,
            next_waiter: 1,
            waiters: VecDeque::new(),
        }
    }
}

/// Event whose 'set' state is consumed by exactly one waiter.
///
/// `set()` releases the longest-waiting pending waiter, or is remembered for
/// the next waiter when none are pending. Setting an already-set event is a
/// no-op.
#[derive(Clone, Default)]
pub struct AsyncAutoResetEvent {
    inner: Arc<Mutex<AutoResetState>>,
}

impl AsyncAutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event; exactly one waiter (current or future) consumes it.
    pub fn set(&self) {
        let waker = {
            let mut state = self.inner.lock();
            if state.set {
                return;
            }
            state.set = true;
            state.waiters.front().map(|(_, w)| w.clone())
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Wait until the event is set; consuming the set resets it.
    pub fn wait(&self) -> AutoResetWait {
        let ticket = {
            let mut state = self.inner.lock();
            let ticket = state.next_waiter;
            state.next_waiter += 1;
            ticket
        };
        AutoResetWait {
            inner: Arc::clone(&self.inner),
            ticket,
        }
    }
}

impl fmt::Debug for AsyncAutoResetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("AsyncAutoResetEvent")
            .field("set", &state.set)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Future returned by [`AsyncAutoResetEvent::wait`].
pub struct AutoResetWait {
    inner: Arc<Mutex<AutoResetState>>,
    ticket: u64,
}

impl Future for AutoResetWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.inner.lock();
        if state.set {
            state.set = false;
            state.waiters.retain(|(t, _)| *t != self.ticket);
            return Poll::Ready(());
        }
        match state.waiters.iter_mut().find(|(t, _)| *t == self.ticket) {
            Some((_, waker)) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => state.waiters.push_back((self.ticket, cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for AutoResetWait {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.inner.lock();
            state.waiters.retain(|(t, _)| *t != self.ticket);
            // Hand an unconsumed set to the next waiter instead of losing it.
            if state.set {
                state.waiters.front().map(|(_, w)| w.clone())
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl fmt::Debug for AutoResetWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoResetWait")
            .field("ticket", &self.ticket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll, Wake, Waker};

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        (counter, waker)
    }

    #[test]
    fn test_manual_reset_wakes_all_waiters() {
        let event = AsyncManualResetEvent::new();
        let (counter_a, waker_a) = counting_waker();
        let (counter_b, waker_b) = counting_waker();

        let mut wait_a = pin!(event.wait());
        let mut wait_b = pin!(event.wait());
        assert!(wait_a
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_pending());
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_pending());

        event.set();
        assert_eq!(counter_a.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.0.load(Ordering::SeqCst), 1);

        assert_eq!(
            wait_a.as_mut().poll(&mut Context::from_waker(&waker_a)),
            Poll::Ready(())
        );
        assert_eq!(
            wait_b.as_mut().poll(&mut Context::from_waker(&waker_b)),
            Poll::Ready(())
        );

        // Set-until-reset: a late waiter completes immediately.
        let mut wait_c = pin!(event.wait());
        assert!(wait_c
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_ready());

        event.reset();
        let mut wait_d = pin!(event.wait());
        assert!(wait_d
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_pending());
    }

    #[test]
    fn test_auto_reset_releases_exactly_one() {
        let event = AsyncAutoResetEvent::new();
        let (counter_a, waker_a) = counting_waker();
        let (counter_b, waker_b) = counting_waker();

        let mut wait_a = pin!(event.wait());
        let mut wait_b = pin!(event.wait());
        assert!(wait_a
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_pending());
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_pending());

        event.set();
        // Only the front waiter is woken.
        assert_eq!(counter_a.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.0.load(Ordering::SeqCst), 0);

        assert!(wait_a
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_ready());
        // Consumed: the second waiter still blocks.
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_pending());

        event.set();
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_ready());
    }

    #[test]
    fn test_auto_reset_set_without_waiters_is_latched_once() {
        let event = AsyncAutoResetEvent::new();
        event.set();
        event.set();
        assert!(event.is_set());

        let (_, waker) = counting_waker();
        let mut first = pin!(event.wait());
        assert!(first
            .as_mut()
            .poll(&mut Context::from_waker(&waker))
            .is_ready());

        let mut second = pin!(event.wait());
        assert!(second
            .as_mut()
            .poll(&mut Context::from_waker(&waker))
            .is_pending());
    }

    #[test]
    fn test_auto_reset_dropped_waiter_passes_set_on() {
        let event = AsyncAutoResetEvent::new();
        let (_, waker_a) = counting_waker();
        let (counter_b, waker_b) = counting_waker();

        let mut wait_a = Box::pin(event.wait());
        let mut wait_b = Box::pin(event.wait());
        assert!(wait_a
            .as_mut()
            .poll(&mut Context::from_waker(&waker_a))
            .is_pending());
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_pending());

        event.set();
        drop(wait_a);
        // The woken-but-dropped waiter handed the set to the next in line.
        assert_eq!(counter_b.0.load(Ordering::SeqCst), 1);
        assert!(wait_b
            .as_mut()
            .poll(&mut Context::from_waker(&waker_b))
            .is_ready());
    }
}
