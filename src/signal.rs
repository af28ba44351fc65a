//! Profiling-signal bookkeeping and the silent switch.
//!
//! Every slow trace that could trigger a profile is counted against its
//! slow-report tuple on the agent node that saw it. A tuple whose triggers
//! all fail is reported for suppression ("close") and reported again for
//! recovery once a trigger succeeds, unless another tuple on the same
//! pid+url is still suppressed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::TenantRegistry;
use crate::export::health::HealthMetrics;
use crate::model::{RecordKind, SlowReportCountMetric, SpanTrace};
use crate::store::Store;
use crate::tenant::TenantKey;

/// Identity of one entry endpoint to call target pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlowReportTuple {
    pub entry_service: String,
    pub entry_url: String,
    pub mutated_service: String,
    pub mutated_pid: u32,
    pub mutated_url: String,
}

impl SlowReportTuple {
    /// Key the agent uses to switch profiling for a process endpoint.
    pub fn pid_url(&self) -> String {
        format!("{}-{}", self.mutated_pid, self.mutated_url)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SilentStatus {
    #[default]
    Init,
    Closing,
    Finished,
}

/// Decision produced by evaluating one tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCheck {
    pub to_close: bool,
    pub to_recover: bool,
    pub silent: bool,
}

/// Running counters of one tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlowReportMetric {
    pub total: u64,
    pub success: u64,
    pub status: SilentStatus,
}

impl SlowReportMetric {
    pub fn observe(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        }
    }

    /// Advances the suppression state.
    ///
    /// Init with failures only moves to Closing and asks to close; Init with
    /// any success moves to Finished. Closing moves to Finished and asks to
    /// recover once a success is seen. The tuple is silent while Closing.
    pub fn check_status(&mut self) -> StatusCheck {
        let mut check = StatusCheck::default();
        match self.status {
            SilentStatus::Init if self.total > 0 => {
                if self.success == 0 {
                    self.status = SilentStatus::Closing;
                    check.to_close = true;
                } else {
                    self.status = SilentStatus::Finished;
                }
            }
            SilentStatus::Closing if self.success > 0 => {
                self.status = SilentStatus::Finished;
                check.to_recover = true;
            }
            _ => {}
        }
        check.silent = self.status == SilentStatus::Closing;
        check
    }
}

/// Profile request handed to a agent node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSignal {
    pub pid: u32,
    pub tid: u32,
    pub start_time: u64,
    pub end_time: u64,
}

/// Pid+url keys to suppress and to re-enable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SilentSwitches {
    pub close: Vec<String>,
    pub recover: Vec<String>,
}

/// Signal state of one agent node.
#[derive(Default)]
struct NodeSignals {
    metrics: DashMap<SlowReportTuple, SlowReportMetric>,
    profile_signals: Mutex<Vec<String>>,
}

impl NodeSignals {
    fn query_silent_switches(&self) -> SilentSwitches {
        let mut close = BTreeSet::new();
        let mut recover = BTreeSet::new();
        let mut silent = BTreeSet::new();

        for mut entry in self.metrics.iter_mut() {
            let check = entry.value_mut().check_status();
            if !(check.to_close || check.to_recover || check.silent) {
                continue;
            }
            let pid_url = entry.key().pid_url();
            if check.to_close {
                close.insert(pid_url.clone());
            }
            if check.to_recover {
                recover.insert(pid_url.clone());
            }
            if check.silent {
                silent.insert(pid_url);
            }
        }

        SilentSwitches {
            close: close.into_iter().collect(),
            recover: recover.difference(&silent).cloned().collect(),
        }
    }

    fn collect(&self, now_ns: u64) -> Vec<SlowReportCountMetric> {
        let mut out = Vec::new();
        self.metrics.retain(|tuple, metric| {
            if metric.total > 0 {
                out.push(SlowReportCountMetric {
                    timestamp_ns: now_ns,
                    entry_service: tuple.entry_service.clone(),
                    entry_url: tuple.entry_url.clone(),
                    mutated_service: tuple.mutated_service.clone(),
                    mutated_pid: tuple.mutated_pid,
                    mutated_url: tuple.mutated_url.clone(),
                    total: metric.total,
                    success: metric.success,
                });
            }
            false
        });
        out
    }
}

/// Per-tenant, per-node signal state.
#[derive(Default)]
pub struct SignalCache {
    tenants: DashMap<TenantKey, Arc<DashMap<String, Arc<NodeSignals>>>>,
    health: Option<Arc<HealthMetrics>>,
}

impl SignalCache {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            tenants: DashMap::new(),
            health,
        }
    }

    fn node(&self, tenant: &TenantKey, node_ip: &str) -> Arc<NodeSignals> {
        let nodes = Arc::clone(
            self.tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        );
        let node = Arc::clone(
            nodes
                .entry(node_ip.to_string())
                .or_insert_with(|| Arc::new(NodeSignals::default()))
                .value(),
        );
        node
    }

    fn existing_node(&self, tenant: &TenantKey, node_ip: &str) -> Option<Arc<NodeSignals>> {
        let nodes = self.tenants.get(tenant).map(|n| Arc::clone(n.value()))?;
        let node = nodes.get(node_ip).map(|n| Arc::clone(n.value()));
        node
    }

    /// Counts one slow trace against its tuple on the trace's agent node.
    /// With `need_profile` a profile request is also queued for that node.
    pub fn add_signal(
        &self,
        tenant: &TenantKey,
        entry_service: &str,
        entry_url: &str,
        trace: &SpanTrace,
        need_profile: bool,
    ) {
        let node = self.node(tenant, &trace.node_ip);

        let tuple = SlowReportTuple {
            entry_service: entry_service.to_string(),
            entry_url: entry_url.to_string(),
            mutated_service: trace.instance_id(),
            mutated_pid: trace.pid,
            mutated_url: trace.url.clone(),
        };
        node.metrics
            .entry(tuple)
            .or_default()
            .observe(trace.is_profiled);

        if need_profile {
            let signal = ProfileSignal {
                pid: trace.pid,
                tid: trace.tid,
                start_time: trace.start_time_ns,
                end_time: trace.end_time_ns,
            };
            match serde_json::to_string(&signal) {
                Ok(json) => node.profile_signals.lock().push(json),
                Err(e) => tracing::warn!(node_ip = %trace.node_ip, error = %e, "encoding profile signal"),
            }
        }
    }

    /// Evaluates every tuple of a agent node and returns the pid+url keys to
    /// close and to recover. A key still silent through any tuple is never
    /// recovered.
    pub fn query_silent_switches(&self, tenant: &TenantKey, node_ip: &str) -> SilentSwitches {
        let Some(node) = self.existing_node(tenant, node_ip) else {
            return SilentSwitches::default();
        };

        let switches = node.query_silent_switches();
        if let Some(health) = &self.health {
            health.silent_switch_close.inc_by(switches.close.len() as f64);
            health.silent_switch_recover.inc_by(switches.recover.len() as f64);
        }
        if !switches.close.is_empty() || !switches.recover.is_empty() {
            tracing::debug!(
                node_ip,
                close = switches.close.len(),
                recover = switches.recover.len(),
                "silent switches"
            );
        }
        switches
    }

    /// Drains queued profile requests of a agent node.
    pub fn take_profile_signals(&self, tenant: &TenantKey, node_ip: &str) -> Vec<String> {
        self.existing_node(tenant, node_ip)
            .map(|node| std::mem::take(&mut *node.profile_signals.lock()))
            .unwrap_or_default()
    }

    /// Converts every tuple's counters into a count metric and clears them.
    /// Tuples without observations produce nothing.
    pub fn collect_once(&self, now_ns: u64) -> Vec<(TenantKey, Vec<SlowReportCountMetric>)> {
        let tenants: Vec<(TenantKey, Arc<DashMap<String, Arc<NodeSignals>>>)> = self
            .tenants
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut out = Vec::new();
        for (tenant, nodes) in tenants {
            let node_list: Vec<Arc<NodeSignals>> = nodes.iter().map(|n| Arc::clone(n.value())).collect();
            let metrics: Vec<SlowReportCountMetric> =
                node_list.iter().flat_map(|node| node.collect(now_ns)).collect();
            if metrics.is_empty() {
                continue;
            }
            if let Some(health) = &self.health {
                health.signal_metrics_collected.inc_by(metrics.len() as f64);
            }
            out.push((tenant, metrics));
        }
        out
    }
}

/// Moves collected count metrics into tenant caches on a fixed cadence.
pub struct SignalCollector<S: Store> {
    signals: Arc<SignalCache>,
    registry: Arc<TenantRegistry>,
    store: Arc<S>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Store> SignalCollector<S> {
    pub fn new(
        signals: Arc<SignalCache>,
        registry: Arc<TenantRegistry>,
        store: Arc<S>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            signals,
            registry,
            store,
            health,
        }
    }

    /// Collects every tuple's counters and appends the resulting metrics to
    /// the owning tenant's cache. Returns how many metrics were appended.
    pub async fn collect_once(&self, now_ns: u64) -> usize {
        let mut appended = 0;
        let mut failed = 0;
        for (tenant, metrics) in self.signals.collect_once(now_ns) {
            let cache = self.registry.get_or_abort(&tenant, self.store.as_ref()).await;
            appended += metrics.len();
            failed += metrics.iter().map(SlowReportCountMetric::failed).sum::<u64>();
            cache.report_metrics.extend(metrics);
        }

        if appended > 0 {
            if let Some(health) = &self.health {
                health
                    .records_appended
                    .with_label_values(&[RecordKind::ReportMetric.as_str()])
                    .inc_by(appended as f64);
            }
            tracing::debug!(appended, failed, "slow report counts collected");
        }
        appended
    }

    /// Collects every `interval` until `cancel` fires, then once more so the
    /// last partial interval reaches the caches.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.collect_once(now_millis_ns()).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        self.collect_once(now_millis_ns()).await;
                    }
                }
            }
        })
    }
}

/// Current wall-clock time truncated to milliseconds, in nanoseconds.
fn now_millis_ns() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    millis * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(pid: u32, url: &str, profiled: bool) -> SpanTrace {
        SpanTrace {
            pid,
            tid: pid + 1,
            url: url.to_string(),
            node_name: "node-1".to_string(),
            node_ip: "10.0.0.1".to_string(),
            start_time_ns: 100,
            end_time_ns: 200,
            is_profiled: profiled,
            ..Default::default()
        }
    }

    #[test]
    fn test_check_status_transitions() {
        let mut metric = SlowReportMetric::default();
        assert_eq!(metric.check_status(), StatusCheck::default());

        metric.observe(false);
        let check = metric.check_status();
        assert!(check.to_close && check.silent && !check.to_recover);
        assert_eq!(metric.status, SilentStatus::Closing);

        // Still failing: stays silent without asking to close again.
        metric.observe(false);
        let check = metric.check_status();
        assert!(!check.to_close && check.silent);

        metric.observe(true);
        let check = metric.check_status();
        assert!(check.to_recover && !check.silent);
        assert_eq!(metric.status, SilentStatus::Finished);

        assert_eq!(metric.check_status(), StatusCheck::default());
    }

    #[test]
    fn test_init_with_success_finishes_quietly() {
        let mut metric = SlowReportMetric::default();
        metric.observe(false);
        metric.observe(true);
        assert_eq!(metric.check_status(), StatusCheck::default());
        assert_eq!(metric.status, SilentStatus::Finished);
    }

    #[test]
    fn test_close_then_recover() {
        let cache = SignalCache::default();
        let tenant = TenantKey::none();

        for _ in 0..3 {
            cache.add_signal(&tenant, "gw", "/a", &trace(42, "/slow", false), false);
        }
        let switches = cache.query_silent_switches(&tenant, "10.0.0.1");
        assert_eq!(switches.close, vec!["42-/slow".to_string()]);
        assert!(switches.recover.is_empty());

        cache.add_signal(&tenant, "gw", "/a", &trace(42, "/slow", true), false);
        let switches = cache.query_silent_switches(&tenant, "10.0.0.1");
        assert!(switches.close.is_empty());
        assert_eq!(switches.recover, vec!["42-/slow".to_string()]);
    }

    #[test]
    fn test_recover_suppressed_by_silent_sibling() {
        let cache = SignalCache::default();
        let tenant = TenantKey::none();

        for _ in 0..3 {
            cache.add_signal(&tenant, "gw", "/a", &trace(42, "/slow", false), false);
        }
        // Different entry, same pid+url.
        cache.add_signal(&tenant, "gw", "/b", &trace(42, "/slow", false), false);

        let switches = cache.query_silent_switches(&tenant, "10.0.0.1");
        assert_eq!(switches.close, vec!["42-/slow".to_string()]);

        cache.add_signal(&tenant, "gw", "/a", &trace(42, "/slow", true), false);
        let switches = cache.query_silent_switches(&tenant, "10.0.0.1");
        assert!(switches.recover.is_empty());
    }

    #[test]
    fn test_query_unknown_node() {
        let cache = SignalCache::default();
        assert_eq!(
            cache.query_silent_switches(&TenantKey::none(), "nowhere"),
            SilentSwitches::default()
        );
    }

    #[test]
    fn test_collect_drains_counters() {
        let cache = SignalCache::default();
        let tenant = TenantKey::new("t", "1");
        cache.add_signal(&tenant, "gw", "/a", &trace(7, "/x", true), false);
        cache.add_signal(&tenant, "gw", "/a", &trace(7, "/x", false), false);

        let collected = cache.collect_once(1_000);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, tenant);
        let metric = &collected[0].1[0];
        assert_eq!(metric.total, 2);
        assert_eq!(metric.success, 1);
        assert_eq!(metric.timestamp_ns, 1_000);
        assert_eq!(metric.mutated_service, "7@node-1");

        assert!(cache.collect_once(2_000).is_empty());
        // State was reset with the counters.
        assert_eq!(
            cache.query_silent_switches(&tenant, "10.0.0.1"),
            SilentSwitches::default()
        );
    }

    #[test]
    fn test_tenants_do_not_share_nodes() {
        let cache = SignalCache::default();
        let a = TenantKey::new("a", "1");
        let b = TenantKey::new("b", "1");
        cache.add_signal(&a, "gw", "/a", &trace(1, "/x", false), false);

        assert_eq!(cache.query_silent_switches(&b, "10.0.0.1").close.len(), 0);
        assert_eq!(cache.query_silent_switches(&a, "10.0.0.1").close.len(), 1);
    }

    #[test]
    fn test_profile_signals_queued_per_node() {
        let cache = SignalCache::default();
        let tenant = TenantKey::none();
        cache.add_signal(&tenant, "gw", "/a", &trace(5, "/x", false), true);
        cache.add_signal(&tenant, "gw", "/a", &trace(5, "/x", false), false);

        let signals = cache.take_profile_signals(&tenant, "10.0.0.1");
        assert_eq!(signals.len(), 1);
        let decoded: ProfileSignal = serde_json::from_str(&signals[0]).unwrap();
        assert_eq!(
            decoded,
            ProfileSignal {
                pid: 5,
                tid: 6,
                start_time: 100,
                end_time: 200,
            }
        );
        assert!(cache.take_profile_signals(&tenant, "10.0.0.1").is_empty());
    }

    #[tokio::test]
    async fn test_collector_appends_to_tenant_cache() {
        let registry = Arc::new(TenantRegistry::new(crate::config::ClickHouseConfig::default(), true));
        let store = Arc::new(crate::store::MemoryStore::new());
        let signals = Arc::new(SignalCache::default());
        let collector = SignalCollector::new(Arc::clone(&signals), Arc::clone(&registry), Arc::clone(&store), None);

        let tenant = TenantKey::new("acme", "3");
        signals.add_signal(&tenant, "gw", "/a", &trace(1, "/x", false), false);
        signals.add_signal(&tenant, "gw", "/b", &trace(1, "/x", true), false);

        assert_eq!(collector.collect_once(5_000_000).await, 2);
        let cache = registry.get_or_create(&tenant, store.as_ref()).await.unwrap();
        let metrics = cache.report_metrics.drain();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.timestamp_ns == 5_000_000));
        assert_eq!(store.initialized(), vec!["apo_tenant_acme".to_string()]);

        assert_eq!(collector.collect_once(6_000_000).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_final_collect_on_cancel() {
        let registry = Arc::new(TenantRegistry::new(crate::config::ClickHouseConfig::default(), false));
        let store = Arc::new(crate::store::MemoryStore::new());
        let signals = Arc::new(SignalCache::default());
        let collector = Arc::new(SignalCollector::new(
            Arc::clone(&signals),
            Arc::clone(&registry),
            store,
            None,
        ));

        let cancel = CancellationToken::new();
        let handle = collector.spawn(Duration::from_secs(60), cancel.clone());

        signals.add_signal(&TenantKey::none(), "gw", "/a", &trace(1, "/x", false), false);
        cancel.cancel();
        handle.await.unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].cache.report_metrics.len(), 1);
    }
}
