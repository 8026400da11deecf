//! Runtime counters maintained by the dependency manager.

use serde::Serialize;

/// Counters for one manager's event loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeMetrics {
    /// Events popped and run through interceptor/dispatch processing.
    pub events_processed: u64,
    /// Events suppressed by an interceptor's `pre`.
    pub events_suppressed: u64,
    /// Handler callbacks invoked.
    pub handlers_invoked: u64,
    /// Continuations entered into the table (including ones that completed
    /// on their first poll).
    pub continuations_scheduled: u64,
    /// Continuations discarded because their owning service had stopped.
    pub continuations_discarded: u64,
    /// Handler or lifecycle coroutines that panicked and were isolated.
    pub handler_panics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_is_zeroed() {
        let metrics = RuntimeMetrics::default();
        assert_eq!(metrics.events_processed, 0);
        assert_eq!(metrics.continuations_discarded, 0);
    }
}
