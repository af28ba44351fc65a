//! Multi-tenant APM telemetry aggregation with scheduled batched flushes
//! to ClickHouse.

pub mod cache;
pub mod config;
pub mod export;
pub mod flush;
pub mod model;
pub mod pipeline;
pub mod signal;
pub mod store;
pub mod tenant;
