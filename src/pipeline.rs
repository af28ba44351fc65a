//! Composition of every registry and background task behind the operations
//! request handlers call.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{EventCache, Pending, TenantRegistry};
use crate::config::Config;
use crate::export::client_metric::ClientMetrics;
use crate::export::health::HealthMetrics;
use crate::flush::{FlushOptions, FlushReport, Flusher};
use crate::model::{
    AgentEvent, ErrorReport, FlameGraph, JvmGc, NodeReport, OnOffMetric, ProfilingEvent,
    RecordKind, Relation, SlowReportCountMetric, SpanTrace,
};
use crate::signal::{SignalCache, SignalCollector, SilentSwitches};
use crate::store::{StatementCache, Store};
use crate::tenant::{TenantKey, TraceTenantCache};

/// Ingestion core: owns the tenant registry, the statement cache, the
/// signal cache and the tasks that drain them.
pub struct Pipeline<S: Store> {
    cfg: Config,
    store: Arc<S>,
    registry: Arc<TenantRegistry>,
    statements: Arc<StatementCache>,
    flusher: Arc<Flusher<S>>,
    signals: Arc<SignalCache>,
    collector: Arc<SignalCollector<S>>,
    traces: TraceTenantCache,
    health: Option<Arc<HealthMetrics>>,

    collect_cancel: CancellationToken,
    flush_cancel: CancellationToken,
    sweep_cancel: CancellationToken,
    collect_task: Option<JoinHandle<()>>,
    flush_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl<S: Store> Pipeline<S> {
    pub fn new(
        cfg: Config,
        store: Arc<S>,
        health: Option<Arc<HealthMetrics>>,
        client_metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let registry = Arc::new(TenantRegistry::new(cfg.clickhouse.clone(), cfg.tenancy.enabled));
        let statements = Arc::new(StatementCache::new(
            cfg.statement_cache.idle_timeout,
            health.clone(),
        ));

        let mut flusher = Flusher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&statements),
            FlushOptions {
                interval: cfg.clickhouse.effective_flush_interval(),
                export_service_client: cfg.clickhouse.export_service_client,
            },
        );
        if let Some(metrics) = client_metrics {
            flusher = flusher.with_client_metrics(metrics);
        }
        if let Some(health) = &health {
            flusher = flusher.with_health(Arc::clone(health));
        }

        let signals = Arc::new(SignalCache::new(health.clone()));
        let collector = Arc::new(SignalCollector::new(
            Arc::clone(&signals),
            Arc::clone(&registry),
            Arc::clone(&store),
            health.clone(),
        ));

        Self {
            traces: TraceTenantCache::new(cfg.tenancy.trace_cache_size),
            cfg,
            store,
            registry,
            statements,
            flusher: Arc::new(flusher),
            signals,
            collector,
            health,
            collect_cancel: CancellationToken::new(),
            flush_cancel: CancellationToken::new(),
            sweep_cancel: CancellationToken::new(),
            collect_task: None,
            flush_task: None,
            sweep_task: None,
        }
    }

    /// Initialises the shared database (single-tenant mode) and spawns the
    /// flush, statement sweep and signal collection tasks.
    pub async fn start(&mut self) -> Result<()> {
        if !self.registry.is_multi_tenant() {
            let database = self.registry.database_for(&TenantKey::none());
            self.store
                .init_database(&database)
                .await
                .with_context(|| format!("initializing database {database}"))?;
        }

        self.flush_task = Some(Arc::clone(&self.flusher).spawn(self.flush_cancel.clone()));
        self.sweep_task = Some(Arc::clone(&self.statements).spawn_sweeper(self.sweep_cancel.clone()));
        self.collect_task = Some(
            Arc::clone(&self.collector).spawn(self.cfg.signal.collect_interval, self.collect_cancel.clone()),
        );

        info!(
            multi_tenant = self.registry.is_multi_tenant(),
            flush_interval = ?self.cfg.clickhouse.effective_flush_interval(),
            "pipeline started"
        );

        Ok(())
    }

    /// Stops the tasks in dependency order: signal collection feeds the
    /// caches, the final flush drains them, then statements are closed.
    pub async fn stop(&mut self) -> Result<()> {
        self.collect_cancel.cancel();
        join("signal collector", self.collect_task.take()).await;

        self.flush_cancel.cancel();
        join("flusher", self.flush_task.take()).await;

        self.sweep_cancel.cancel();
        join("statement sweeper", self.sweep_task.take()).await;

        info!("pipeline stopped");
        Ok(())
    }

    /// Runs one flush cycle outside the schedule.
    pub async fn flush_once(&self) -> FlushReport {
        self.flusher.flush_once().await
    }

    /// Runs one signal collection outside the schedule.
    pub async fn collect_signals_once(&self, now_ns: u64) -> usize {
        self.collector.collect_once(now_ns).await
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// The tenant's cache. A tenant whose database cannot be initialised
    /// terminates the process.
    pub async fn cache_for(&self, tenant: &TenantKey) -> Arc<EventCache> {
        self.registry.get_or_abort(tenant, self.store.as_ref()).await
    }

    async fn append<T>(
        &self,
        tenant: &TenantKey,
        kind: RecordKind,
        records: Vec<T>,
        pending: impl FnOnce(&EventCache) -> &Pending<T>,
    ) {
        if records.is_empty() {
            return;
        }
        let count = records.len();
        let cache = self.cache_for(tenant).await;
        pending(cache.as_ref()).extend(records);

        if let Some(health) = &self.health {
            health
                .records_appended
                .with_label_values(&[kind.as_str()])
                .inc_by(count as f64);
        }
    }

    pub async fn store_profiling_event(&self, tenant: &TenantKey, event: ProfilingEvent) {
        self.append(tenant, RecordKind::ProfilingEvent, vec![event], |c| &c.profiling_events)
            .await;
    }

    pub async fn store_flame_graph(&self, tenant: &TenantKey, graph: FlameGraph) {
        self.append(tenant, RecordKind::FlameGraph, vec![graph], |c| &c.flame_graphs)
            .await;
    }

    pub async fn store_jvm_gc(&self, tenant: &TenantKey, gc: JvmGc) {
        self.append(tenant, RecordKind::JvmGc, vec![gc], |c| &c.jvm_gcs).await;
    }

    /// Appends a group of span traces reported together.
    pub async fn store_span_traces(&self, tenant: &TenantKey, traces: Vec<SpanTrace>) {
        self.append(tenant, RecordKind::SpanTrace, traces, |c| &c.span_traces)
            .await;
    }

    pub async fn store_slow_report(&self, tenant: &TenantKey, report: NodeReport) {
        self.append(tenant, RecordKind::SlowReport, vec![report], |c| &c.slow_reports)
            .await;
    }

    pub async fn store_error_report(&self, tenant: &TenantKey, report: ErrorReport) {
        self.append(tenant, RecordKind::ErrorReport, vec![report], |c| &c.error_reports)
            .await;
    }

    pub async fn store_report_metric(&self, tenant: &TenantKey, metric: SlowReportCountMetric) {
        self.append(tenant, RecordKind::ReportMetric, vec![metric], |c| &c.report_metrics)
            .await;
    }

    pub async fn store_onoff_metric(&self, tenant: &TenantKey, metric: OnOffMetric) {
        self.append(tenant, RecordKind::OnOffMetric, vec![metric], |c| &c.onoff_metrics)
            .await;
    }

    pub async fn store_relation(&self, tenant: &TenantKey, relation: Relation) {
        self.append(tenant, RecordKind::ServiceRelationship, vec![relation], |c| &c.relations)
            .await;
    }

    pub async fn store_agent_event(&self, tenant: &TenantKey, event: AgentEvent) {
        self.append(tenant, RecordKind::AgentEvent, vec![event], |c| &c.agent_events)
            .await;
    }

    /// Signals and traces are keyed by the shared tenant when multi-tenancy
    /// is off.
    fn scope(&self, tenant: &TenantKey) -> TenantKey {
        if self.registry.is_multi_tenant() {
            tenant.clone()
        } else {
            TenantKey::none()
        }
    }

    pub fn add_signal(
        &self,
        tenant: &TenantKey,
        entry_service: &str,
        entry_url: &str,
        trace: &SpanTrace,
        need_profile: bool,
    ) {
        self.signals
            .add_signal(&self.scope(tenant), entry_service, entry_url, trace, need_profile);
    }

    pub fn query_silent_switches(&self, tenant: &TenantKey, node_ip: &str) -> SilentSwitches {
        self.signals.query_silent_switches(&self.scope(tenant), node_ip)
    }

    pub fn take_profile_signals(&self, tenant: &TenantKey, node_ip: &str) -> Vec<String> {
        self.signals.take_profile_signals(&self.scope(tenant), node_ip)
    }

    /// Remembers which tenant a trace belongs to, for callbacks that carry
    /// only the trace id.
    pub fn store_trace_tenant(&self, trace_id: &str, tenant: &TenantKey) {
        self.traces.store_tenant(trace_id, self.scope(tenant));
    }

    pub fn tenant_for_trace(&self, trace_id: &str) -> Option<TenantKey> {
        self.traces.tenant_for_trace(trace_id)
    }

    pub fn touch_trace(&self, trace_id: &str) {
        self.traces.touch(trace_id);
    }
}

async fn join(name: &'static str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config(multi_tenant: bool) -> Config {
        let mut cfg = Config::default();
        cfg.clickhouse.endpoint = "localhost:9000".to_string();
        cfg.tenancy.enabled = multi_tenant;
        cfg
    }

    fn pipeline(multi_tenant: bool) -> (Pipeline<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Pipeline::new(config(multi_tenant), Arc::clone(&store), None, None), store)
    }

    #[tokio::test]
    async fn test_append_then_flush() {
        let (pipeline, store) = pipeline(false);
        pipeline.store_jvm_gc(&TenantKey::none(), JvmGc::default()).await;
        pipeline
            .store_span_traces(&TenantKey::none(), vec![SpanTrace::default(); 2])
            .await;

        let report = pipeline.flush_once().await;
        assert_eq!(report.rows_written, 3);
        assert_eq!(store.batches_for("span_trace")[0].rows.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_append_creates_nothing() {
        let (pipeline, store) = pipeline(true);
        pipeline.store_span_traces(&TenantKey::new("t", "1"), Vec::new()).await;
        assert_eq!(pipeline.registry().tenant_count(), 0);
        assert!(store.initialized().is_empty());
    }

    #[tokio::test]
    async fn test_start_initializes_shared_database() {
        let (mut pipeline, store) = pipeline(false);
        pipeline.start().await.unwrap();
        assert_eq!(store.initialized(), vec!["apo".to_string()]);

        pipeline.store_jvm_gc(&TenantKey::none(), JvmGc::default()).await;
        pipeline.stop().await.unwrap();

        // Final flush on stop.
        assert_eq!(store.batches_for("jvm_gc").len(), 1);
        assert!(pipeline.statements().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_database_unavailable() {
        let (mut pipeline, store) = pipeline(false);
        store.fail_init(true);
        let err = pipeline.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("initializing database apo"));
    }

    #[tokio::test]
    async fn test_signals_scoped_to_shared_tenant() {
        let (pipeline, _store) = pipeline(false);
        let trace = SpanTrace {
            pid: 9,
            url: "/slow".to_string(),
            node_ip: "10.1.1.1".to_string(),
            ..Default::default()
        };
        pipeline.add_signal(&TenantKey::new("ignored", "1"), "gw", "/a", &trace, false);

        let switches = pipeline.query_silent_switches(&TenantKey::none(), "10.1.1.1");
        assert_eq!(switches.close, vec!["9-/slow".to_string()]);
    }

    #[tokio::test]
    async fn test_trace_tenant_lookup() {
        let (pipeline, _store) = pipeline(true);
        let tenant = TenantKey::new("acme", "4");
        pipeline.store_trace_tenant("trace-1", &tenant);
        pipeline.touch_trace("trace-1");
        assert_eq!(pipeline.tenant_for_trace("trace-1"), Some(tenant));
        assert_eq!(pipeline.tenant_for_trace("trace-2"), None);
    }
}
