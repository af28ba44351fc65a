//! Periodic drain of every tenant cache into the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{TenantCache, TenantRegistry};
use crate::export::client_metric::ClientMetrics;
use crate::export::health::HealthMetrics;
use crate::model::{ErrorPropagation, Relation, ServiceClient};
use crate::store::rows::encode_all;
use crate::store::{Statement, StatementCache, Store, StoreError, TableDef, TableRow};

/// Flush behaviour knobs.
#[derive(Debug, Clone)]
pub struct FlushOptions {
    pub interval: Duration,
    /// Also write service_client rows derived from relations.
    pub export_service_client: bool,
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub tenants: usize,
    pub rows_written: usize,
    pub rows_lost: usize,
    pub failed_batches: usize,
}

/// Drains tenant caches and writes one batch per record kind.
///
/// A failed batch is logged and counted as lost; the remaining kinds and
/// tenants are still attempted. Nothing is retried.
pub struct Flusher<S: Store> {
    store: Arc<S>,
    registry: Arc<TenantRegistry>,
    statements: Arc<StatementCache>,
    client_metrics: Option<Arc<ClientMetrics>>,
    health: Option<Arc<HealthMetrics>>,
    options: FlushOptions,
}

impl<S: Store> Flusher<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<TenantRegistry>,
        statements: Arc<StatementCache>,
        options: FlushOptions,
    ) -> Self {
        Self {
            store,
            registry,
            statements,
            client_metrics: None,
            health: None,
            options,
        }
    }

    pub fn with_client_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.client_metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Runs a single flush over every known tenant.
    pub async fn flush_once(&self) -> FlushReport {
        let started = Instant::now();
        let tenants = self.registry.snapshot();

        let mut report = FlushReport {
            tenants: tenants.len(),
            ..Default::default()
        };

        for tenant in &tenants {
            self.flush_tenant(tenant, &mut report).await;
        }

        if let Some(health) = &self.health {
            health.flushes.inc();
            health.flush_duration.observe(started.elapsed().as_secs_f64());
            health.tenants.set(self.registry.tenant_count() as f64);
        }

        if report.rows_written > 0 || report.rows_lost > 0 {
            tracing::debug!(
                tenants = report.tenants,
                written = report.rows_written,
                lost = report.rows_lost,
                elapsed = ?started.elapsed(),
                "flush complete"
            );
        }

        report
    }

    async fn flush_tenant(&self, tenant: &TenantCache, report: &mut FlushReport) {
        let database = tenant.database.as_str();
        let cache = &tenant.cache;

        self.write(database, &cache.profiling_events.drain(), report).await;
        self.write(database, &cache.flame_graphs.drain(), report).await;
        self.write(database, &cache.jvm_gcs.drain(), report).await;
        self.write(database, &cache.span_traces.drain(), report).await;
        self.write(database, &cache.slow_reports.drain(), report).await;

        let error_reports = cache.error_reports.drain();
        self.write(database, &error_reports, report).await;
        let propagations: Vec<ErrorPropagation> = error_reports
            .iter()
            .filter_map(ErrorPropagation::from_report)
            .collect();
        self.write(database, &propagations, report).await;

        self.write(database, &cache.report_metrics.drain(), report).await;
        self.write(database, &cache.onoff_metrics.drain(), report).await;

        let relations = cache.relations.drain();
        self.write(database, &relations, report).await;
        self.write(database, &cache.agent_events.drain(), report).await;

        if self.options.export_service_client {
            let clients: Vec<ServiceClient> = relations
                .iter()
                .flat_map(Relation::collect_service_clients)
                .collect();
            self.write(database, &clients, report).await;
        }

        if let Some(metrics) = &self.client_metrics {
            for relation in &relations {
                metrics.observe(&tenant.tenant.account_id, relation);
            }
        }
    }

    async fn write<T: TableRow>(&self, database: &str, records: &[T], report: &mut FlushReport) {
        if records.is_empty() {
            return;
        }

        let table = T::TABLE;
        let kind = table.kind.as_str();
        let rows = encode_all(records);
        if rows.is_empty() {
            return;
        }

        match self.write_rows(database, table, &rows).await {
            Ok(()) => {
                report.rows_written += rows.len();
                if let Some(health) = &self.health {
                    health
                        .rows_flushed
                        .with_label_values(&[kind])
                        .inc_by(rows.len() as f64);
                }
            }
            Err(e) => {
                tracing::error!(
                    kind,
                    count = rows.len(),
                    database,
                    error = %e,
                    "batch write failed, rows dropped"
                );
                report.rows_lost += rows.len();
                report.failed_batches += 1;
                if let Some(health) = &self.health {
                    health.flush_errors.with_label_values(&[kind]).inc();
                    health
                        .rows_lost
                        .with_label_values(&[kind])
                        .inc_by(rows.len() as f64);
                }
            }
        }
    }

    async fn write_rows(&self, database: &str, table: TableDef, rows: &[String]) -> Result<(), StoreError> {
        let statement = self.statement(database, table).await?;
        match self.store.execute(&statement, rows).await {
            // Swept between lookup and use.
            Err(StoreError::StatementClosed { .. }) => {
                let statement = self.prepare(database, table).await?;
                self.store.execute(&statement, rows).await
            }
            other => other,
        }
    }

    async fn statement(&self, database: &str, table: TableDef) -> Result<Arc<Statement>, StoreError> {
        if let Some(statement) = self.statements.get(database, table.name()) {
            if let Some(health) = &self.health {
                health.statement_cache_hits.inc();
            }
            return Ok(statement);
        }

        if let Some(health) = &self.health {
            health.statement_cache_misses.inc();
        }
        self.prepare(database, table).await
    }

    async fn prepare(&self, database: &str, table: TableDef) -> Result<Arc<Statement>, StoreError> {
        let statement = self.store.prepare(database, table).await?;
        Ok(self.statements.put(database, table.name(), statement))
    }

    /// Flushes every `interval` until `cancel` fires, then runs one final
    /// flush.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // First tick completes immediately.
            ticker.tick().await;

            tracing::info!(interval = ?self.options.interval, "flusher started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let report = self.flush_once().await;
                        tracing::info!(
                            written = report.rows_written,
                            lost = report.rows_lost,
                            "final flush complete"
                        );
                        return;
                    }
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                }
            }
        })
    }
}
