//! Event statistics: a global interceptor recording per-event-type counts
//! and processing latencies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::dependency::DependencyRegister;
use crate::manager::{get_thread_local_manager, EventInterceptorRegistration};
use crate::provides;
use crate::service::{AdvancedService, Properties, ServiceContext, ServiceHandle};
use crate::types::{EventId, EventTypeHash, StartError};

/// Aggregate statistics for one event type.
#[derive(Debug, Clone, Serialize)]
pub struct EventTypeStats {
    pub name: String,
    pub occurrences: u64,
    pub handled: u64,
    pub suppressed: u64,
    pub total_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
}

impl EventTypeStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            occurrences: 0,
            handled: 0,
            suppressed: 0,
            total_micros: 0,
            min_micros: u64::MAX,
            max_micros: 0,
        }
    }

    pub fn avg_micros(&self) -> u64 {
        if self.occurrences == 0 {
            0
        } else {
            self.total_micros / self.occurrences
        }
    }
}

#[derive(Debug, Default)]
struct StatisticsInner {
    per_type: HashMap<EventTypeHash, EventTypeStats>,
    inflight: HashMap<EventId, Instant>,
}

/// Read side of the statistics service.
pub trait EventStatisticsSource: 'static {
    /// Per-type aggregates, ordered by occurrence count descending.
    fn snapshot(&self) -> Vec<EventTypeStats>;

    fn recording_since(&self) -> DateTime<Utc>;
}

/// Service observing every event on the loop through a global interceptor.
pub struct EventStatisticsService {
    ctx: ServiceContext,
    started_at: DateTime<Utc>,
    inner: Rc<RefCell<StatisticsInner>>,
    registration: Option<EventInterceptorRegistration>,
}

impl EventStatisticsSource for EventStatisticsService {
    fn snapshot(&self) -> Vec<EventTypeStats> {
        let inner = self.inner.borrow();
        let mut stats: Vec<EventTypeStats> = inner.per_type.values().cloned().collect();
        stats.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        stats
    }

    fn recording_since(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl std::fmt::Debug for EventStatisticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStatisticsService")
            .field("service", &self.ctx.id())
            .field("types", &self.inner.borrow().per_type.len())
            .finish()
    }
}

#[async_trait(?Send)]
impl AdvancedService for EventStatisticsService {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        _props: &Properties,
        ctx: ServiceContext,
    ) -> Self {
        EventStatisticsService {
            ctx,
            started_at: Utc::now(),
            inner: Rc::new(RefCell::new(StatisticsInner::default())),
            registration: None,
        }
    }

    async fn start(this: ServiceHandle<Self>) -> Result<(), StartError> {
        let dm = get_thread_local_manager()
            .ok_or_else(|| StartError::new("no manager on this thread"))?;
        let (service, inner) = {
            let stats = this.borrow();
            (stats.ctx.id(), Rc::clone(&stats.inner))
        };

        let inner_pre = Rc::clone(&inner);
        let registration = dm.register_global_interceptor(
            service,
            move |view| {
                let mut inner = inner_pre.borrow_mut();
                inner.inflight.insert(view.id, Instant::now());
                let name = view.name;
                let stats = inner
                    .per_type
                    .entry(view.type_hash)
                    .or_insert_with(|| EventTypeStats::new(name));
                stats.occurrences += 1;
                true
            },
            move |view, processed| {
                let mut inner = inner.borrow_mut();
                let elapsed = inner
                    .inflight
                    .remove(&view.id)
                    .map(|start| start.elapsed().as_micros() as u64)
                    .unwrap_or(0);
                let name = view.name;
                let stats = inner
                    .per_type
                    .entry(view.type_hash)
                    .or_insert_with(|| EventTypeStats::new(name));
                if processed {
                    stats.handled += 1;
                } else {
                    stats.suppressed += 1;
                }
                stats.total_micros += elapsed;
                stats.min_micros = stats.min_micros.min(elapsed);
                stats.max_micros = stats.max_micros.max(elapsed);
            },
        );
        this.borrow_mut().registration = Some(registration);
        Ok(())
    }

    async fn stop(this: ServiceHandle<Self>) {
        this.borrow_mut().registration.take();
    }
}

provides!(EventStatisticsService: dyn EventStatisticsSource);
