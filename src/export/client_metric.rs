use anyhow::Result;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::model::Relation;

const LABELS: [&str; 5] = ["account_id", "service", "client_type", "peer", "url"];

/// Real-time latency of external client calls, derived from relations as
/// they are flushed.
pub struct ClientMetrics {
    with_url: bool,
    latency: HistogramVec,
    errors: CounterVec,
}

impl ClientMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry, with_url: bool) -> Result<Self> {
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "client_latency_seconds",
                "Latency of calls from a service to an external dependency.",
            )
            .namespace("apm_ingest")
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &LABELS,
        )?;
        let errors = CounterVec::new(
            Opts::new(
                "client_errors_total",
                "Failed calls from a service to an external dependency.",
            )
            .namespace("apm_ingest"),
            &LABELS,
        )?;

        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            with_url,
            latency,
            errors,
        })
    }

    /// Observes every client call of `relation` on behalf of `account_id`.
    pub fn observe(&self, account_id: &str, relation: &Relation) {
        for client in relation.collect_service_clients() {
            let url = if self.with_url { client.url.as_str() } else { "" };
            let labels = [
                account_id,
                client.service.as_str(),
                client.client_type.as_str(),
                client.client_peer.as_str(),
                url,
            ];

            self.latency
                .with_label_values(&labels)
                .observe(client.duration_ns as f64 / 1e9);
            if client.is_error {
                self.errors.with_label_values(&labels).inc();
            }
        }
    }
}
