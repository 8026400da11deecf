//! Timer bundle: a service firing `TimerEvent`s at a fixed interval.
//!
//! The helper thread sleeps between ticks and pushes through the thread-safe
//! queue; stopping the service flags the thread down without blocking the
//! loop (the thread exits within one interval, and a post-quit push is
//! harmless).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::dependency::DependencyRegister;
use crate::service::{AdvancedService, Properties, ServiceContext, ServiceHandle};
use crate::types::{ServiceId, StartError};

/// Fired by a [`Timer`] on every interval elapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub timer: ServiceId,
    pub tick: u64,
}

/// Interval timer service.
///
/// The interval comes from the `timer.interval_ms` property (default 1000).
#[derive(Debug)]
pub struct Timer {
    ctx: ServiceContext,
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait(?Send)]
impl AdvancedService for Timer {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        props: &Properties,
        ctx: ServiceContext,
    ) -> Self {
        let interval_ms = props
            .get("timer.interval_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1_000);
        Timer {
            ctx,
            interval: Duration::from_millis(interval_ms),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    async fn start(this: ServiceHandle<Self>) -> Result<(), StartError> {
        let (queue, service, interval, stop_flag) = {
            let timer = this.borrow();
            (
                timer.ctx.queue().clone(),
                timer.ctx.id(),
                timer.interval,
                Arc::clone(&timer.stop_flag),
            )
        };
        stop_flag.store(false, Ordering::Release);

        let worker = thread::Builder::new()
            .name(format!("axon-timer-{service}"))
            .spawn(move || {
                let mut tick: u64 = 0;
                loop {
                    thread::sleep(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    tick += 1;
                    queue.push_event(service, TimerEvent { timer: service, tick });
                }
            })
            .map_err(|e| StartError::new(format!("timer thread spawn failed: {e}")))?;
        this.borrow_mut().worker = Some(worker);
        Ok(())
    }

    async fn stop(this: ServiceHandle<Self>) {
        let worker = {
            let mut timer = this.borrow_mut();
            timer.stop_flag.store(true, Ordering::Release);
            timer.worker.take()
        };
        // Detach rather than join: the thread observes the flag after at
        // most one interval, and joining would block the loop thread.
        drop(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::types::QueueConfig;

    #[test]
    fn test_timer_pushes_ticks_until_stopped() {
        let queue = EventQueue::new(QueueConfig::default());
        let dm = queue.create_manager();
        let mut props = Properties::new();
        props.insert("timer.interval_ms".to_string(), serde_json::json!(5));
        let proxy = dm.create_service_manager::<Timer>(props).build().unwrap();
        dm.run_until_idle();

        // Let a few intervals elapse.
        thread::sleep(Duration::from_millis(40));
        let drained = dm.run_until_idle();
        assert!(drained >= 1, "expected at least one tick, drained {drained}");

        queue.push_stop_service(proxy.id(), false);
        dm.run_until_idle();

        let timer = proxy.get().unwrap();
        assert!(timer.borrow().worker.is_none());
        assert!(timer.borrow().stop_flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_interval_from_properties() {
        let queue = EventQueue::new(QueueConfig::default());
        let dm = queue.create_manager();
        let proxy = dm
            .create_service_manager::<Timer>(Properties::new())
            .build()
            .unwrap();
        dm.run_until_idle();
        assert_eq!(
            proxy.get().unwrap().borrow().interval(),
            Duration::from_secs(1)
        );
    }
}
