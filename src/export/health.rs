use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "apm_ingest";

/// Prometheus metrics for ingestion health.
///
/// All metrics use the "apm_ingest" namespace. Per-kind series are labelled
/// with the record kind (`span_trace`, `error_report`, ...).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Records appended by kind.
    pub records_appended: CounterVec,
    /// Rows written to the store by kind.
    pub rows_flushed: CounterVec,
    /// Failed batch writes by kind.
    pub flush_errors: CounterVec,
    /// Rows drained but not written, by kind.
    pub rows_lost: CounterVec,
    /// Completed flush cycles.
    pub flushes: Counter,
    /// Duration of one flush cycle across all tenants.
    pub flush_duration: Histogram,
    /// Tenants with a live cache.
    pub tenants: Gauge,
    /// Whether the store answered the last ping (1=yes, 0=no).
    pub clickhouse_connected: Gauge,

    /// Live prepared statements.
    pub statement_cache_size: Gauge,
    pub statement_cache_hits: Counter,
    pub statement_cache_misses: Counter,
    /// Statements closed by the idle sweep.
    pub statement_evictions: Counter,

    /// Pid+url keys reported for suppression.
    pub silent_switch_close: Counter,
    /// Pid+url keys reported for recovery.
    pub silent_switch_recover: Counter,
    /// Slow-report count metrics produced by the signal collector.
    pub signal_metrics_collected: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_appended = CounterVec::new(
            Opts::new("records_appended_total", "Records appended by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_flushed = CounterVec::new(
            Opts::new("rows_flushed_total", "Rows written to the store by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let flush_errors = CounterVec::new(
            Opts::new("flush_errors_total", "Failed batch writes by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_lost = CounterVec::new(
            Opts::new(
                "rows_lost_total",
                "Rows drained from a cache but not written, by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Completed flush cycles.").namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Duration of one flush cycle across all tenants.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let tenants = Gauge::with_opts(
            Opts::new("tenants", "Tenants with a live cache.").namespace(NAMESPACE),
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether ClickHouse answered the last ping (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        let statement_cache_size = Gauge::with_opts(
            Opts::new("statement_cache_size", "Live prepared statements.").namespace(NAMESPACE),
        )?;
        let statement_cache_hits = Counter::with_opts(
            Opts::new("statement_cache_hits_total", "Prepared statement cache hits.")
                .namespace(NAMESPACE),
        )?;
        let statement_cache_misses = Counter::with_opts(
            Opts::new(
                "statement_cache_misses_total",
                "Prepared statement cache misses.",
            )
            .namespace(NAMESPACE),
        )?;
        let statement_evictions = Counter::with_opts(
            Opts::new(
                "statement_evictions_total",
                "Statements closed by the idle sweep.",
            )
            .namespace(NAMESPACE),
        )?;

        let silent_switch_close = Counter::with_opts(
            Opts::new(
                "silent_switch_close_total",
                "Pid+url keys reported for profiling suppression.",
            )
            .namespace(NAMESPACE),
        )?;
        let silent_switch_recover = Counter::with_opts(
            Opts::new(
                "silent_switch_recover_total",
                "Pid+url keys reported for profiling recovery.",
            )
            .namespace(NAMESPACE),
        )?;
        let signal_metrics_collected = Counter::with_opts(
            Opts::new(
                "signal_metrics_collected_total",
                "Slow-report count metrics produced by the signal collector.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(records_appended.clone()))?;
        registry.register(Box::new(rows_flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(rows_lost.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(tenants.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(statement_cache_size.clone()))?;
        registry.register(Box::new(statement_cache_hits.clone()))?;
        registry.register(Box::new(statement_cache_misses.clone()))?;
        registry.register(Box::new(statement_evictions.clone()))?;
        registry.register(Box::new(silent_switch_close.clone()))?;
        registry.register(Box::new(silent_switch_recover.clone()))?;
        registry.register(Box::new(signal_metrics_collected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_appended,
            rows_flushed,
            flush_errors,
            rows_lost,
            flushes,
            flush_duration,
            tenants,
            clickhouse_connected,
            statement_cache_size,
            statement_cache_hits,
            statement_cache_misses,
            statement_evictions,
            silent_switch_close,
            silent_switch_recover,
            signal_metrics_collected,
        })
    }

    /// Registry shared with other metric groups served on the same endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serves `/metrics` and `/healthz` until [`stop`](Self::stop). Returns
    /// the bound address, which differs from the configured one for port 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(self.registry.clone());

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server listening");
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = %e, "health server failed");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// Expands the `:port` shorthand to all interfaces; empty means `:9090`.
fn bind_address(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:9090".to_string(),
        a if a.starts_with(':') => format!("0.0.0.0{a}"),
        a => a.to_string(),
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_metrics_registered() {
        let health = HealthMetrics::new(":0").unwrap();
        health.records_appended.with_label_values(&["span_trace"]).inc();
        health.flushes.inc();

        let names: Vec<String> = health
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"apm_ingest_records_appended_total".to_string()));
        assert!(names.contains(&"apm_ingest_flushes_total".to_string()));
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address(":9100"), "0.0.0.0:9100");
        assert_eq!(bind_address("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").unwrap();
        health.rows_flushed.with_label_values(&["jvm_gc"]).inc_by(3.0);
        let addr = health.start().await.unwrap();

        let response = get(addr, "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        let response = get(addr, "/metrics").await;
        assert!(response.contains("apm_ingest_rows_flushed_total{kind=\"jvm_gc\"} 3"));

        health.stop().await.unwrap();
    }
}
