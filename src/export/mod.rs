//! Operator-facing outputs: the Prometheus health endpoint and derived
//! client metrics.

pub mod client_metric;
pub mod health;
