pub mod registry;

pub use registry::{TenantCache, TenantRegistry};

use parking_lot::Mutex;

use crate::model::{
    AgentEvent, ErrorReport, FlameGraph, JvmGc, NodeReport, OnOffMetric, ProfilingEvent, Relation,
    SlowReportCountMetric, SpanTrace,
};

/// Unordered append-only sequence of records awaiting the next flush.
///
/// Appends and drains serialize on one short lock per kind, so a drain
/// sees every append that completed before it and none that started after.
pub struct Pending<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.items.lock().extend(items);
    }

    /// Returns every pending record and leaves the buffer empty.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tenant aggregation buffer holding not-yet-flushed records of every
/// kind.
///
/// Each kind has its own lock; appending one kind never waits on another.
/// Error propagations, service relationships and service clients are
/// derived from `error_reports` and `relations` at flush time.
#[derive(Default)]
pub struct EventCache {
    pub profiling_events: Pending<ProfilingEvent>,
    pub flame_graphs: Pending<FlameGraph>,
    pub jvm_gcs: Pending<JvmGc>,
    pub span_traces: Pending<SpanTrace>,
    pub slow_reports: Pending<NodeReport>,
    pub error_reports: Pending<ErrorReport>,
    pub report_metrics: Pending<SlowReportCountMetric>,
    pub onoff_metrics: Pending<OnOffMetric>,
    pub relations: Pending<Relation>,
    pub agent_events: Pending<AgentEvent>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of pending records across all kinds.
    pub fn pending_len(&self) -> usize {
        self.profiling_events.len()
            + self.flame_graphs.len()
            + self.jvm_gcs.len()
            + self.span_traces.len()
            + self.slow_reports.len()
            + self.error_reports.len()
            + self.report_metrics.len()
            + self.onoff_metrics.len()
            + self.relations.len()
            + self.agent_events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_drain_clears_buffer() {
        let pending = Pending::new();
        pending.append(1u32);
        pending.append(2u32);
        assert_eq!(pending.len(), 2);

        let drained = pending.drain();
        assert_eq!(drained, vec![1, 2]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_drain_empty() {
        let pending: Pending<String> = Pending::default();
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn test_kinds_are_independent() {
        let cache = EventCache::new();
        cache.jvm_gcs.append(JvmGc::default());
        cache.span_traces.append(SpanTrace::default());
        cache.span_traces.append(SpanTrace::default());
        assert_eq!(cache.pending_len(), 3);

        assert_eq!(cache.span_traces.drain().len(), 2);
        assert_eq!(cache.jvm_gcs.len(), 1);
        assert_eq!(cache.pending_len(), 1);
    }

    #[test]
    fn test_concurrent_append_and_drain_no_loss_no_duplicates() {
        let pending = Arc::new(Pending::new());
        let producers = 8;
        let per_producer = 2_000u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let pending = Arc::clone(&pending);
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        pending.append(p * per_producer + i);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while handles.iter().any(|h| !h.is_finished()) {
            seen.extend(pending.drain());
        }
        for handle in handles {
            handle.join().unwrap();
        }
        seen.extend(pending.drain());

        let unique: HashSet<u64> = seen.iter().copied().collect();
        assert_eq!(seen.len() as u64, producers * per_producer);
        assert_eq!(unique.len(), seen.len());
    }
}
