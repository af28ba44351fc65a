//! Encoding of records into SQL value tuples.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::model::{
    AgentEvent, ErrorPropagation, ErrorReport, FlameGraph, JvmGc, NodeReport, OnOffMetric,
    ProfilingEvent, RecordKind, Relation, ServiceClient, SlowReportCountMetric, SpanTrace,
};

use super::TableDef;

/// A record that encodes into rows of one store table.
pub trait TableRow {
    const TABLE: TableDef;

    /// Appends this record's value tuples to `out`. Most records produce
    /// exactly one tuple.
    fn encode_rows(&self, out: &mut Vec<String>);
}

/// Encodes a batch of records.
pub fn encode_all<T: TableRow>(records: &[T]) -> Vec<String> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        record.encode_rows(&mut out);
    }
    out
}

/// Every table written by the flush cycle.
pub const ALL_TABLES: [TableDef; 12] = [
    ProfilingEvent::TABLE,
    FlameGraph::TABLE,
    JvmGc::TABLE,
    SpanTrace::TABLE,
    NodeReport::TABLE,
    ErrorReport::TABLE,
    ErrorPropagation::TABLE,
    SlowReportCountMetric::TABLE,
    OnOffMetric::TABLE,
    Relation::TABLE,
    AgentEvent::TABLE,
    ServiceClient::TABLE,
];

impl TableRow for SpanTrace {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::SpanTrace,
        columns: &[
            "timestamp",
            "trace_id",
            "apm_span_id",
            "service_name",
            "url",
            "pid",
            "tid",
            "container_id",
            "node_name",
            "node_ip",
            "start_time",
            "end_time",
            "duration",
            "is_slow",
            "is_error",
            "is_profiled",
            "labels",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(256);
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', '{}', {}, {}, '{}', '{}', '{}', {}, {}, {}, {}, {}, {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(&self.apm_span_id),
            escape_sql(&self.service_name),
            escape_sql(&self.url),
            self.pid,
            self.tid,
            escape_sql(&self.container_id),
            escape_sql(&self.node_name),
            escape_sql(&self.node_ip),
            self.start_time_ns,
            self.end_time_ns,
            self.duration_ns,
            self.is_slow,
            self.is_error,
            self.is_profiled,
            format_string_map(&self.labels),
        );
        out.push(row);
    }
}

impl TableRow for ProfilingEvent {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ProfilingEvent,
        columns: &[
            "timestamp",
            "trace_id",
            "apm_span_id",
            "node_name",
            "pid",
            "tid",
            "start_time",
            "end_time",
            "events",
            "labels",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(256);
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', {}, {}, {}, {}, {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(&self.apm_span_id),
            escape_sql(&self.node_name),
            self.pid,
            self.tid,
            self.start_time_ns,
            self.end_time_ns,
            format_string_array(&self.events),
            format_string_map(&self.labels),
        );
        out.push(row);
    }
}

impl TableRow for FlameGraph {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::FlameGraph,
        columns: &[
            "timestamp",
            "start_time",
            "end_time",
            "pid",
            "tid",
            "sample_type",
            "sample_rate",
            "labels",
            "flamebearer",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(128 + self.flame_bearer.len());
        let _ = write!(
            row,
            "({}, {}, {}, {}, {}, '{}', {}, {}, '{}')",
            format_datetime64(self.timestamp_ns),
            self.start_time_ns,
            self.end_time_ns,
            self.pid,
            self.tid,
            escape_sql(&self.sample_type),
            self.sample_rate,
            format_string_map(&self.labels),
            escape_sql(&self.flame_bearer),
        );
        out.push(row);
    }
}

impl TableRow for JvmGc {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::JvmGc,
        columns: &[
            "timestamp",
            "node_name",
            "pid",
            "ygc",
            "fgc",
            "last_ygc",
            "last_fgc",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(96);
        let _ = write!(
            row,
            "({}, '{}', {}, {}, {}, {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.node_name),
            self.pid,
            self.young_gc,
            self.full_gc,
            self.last_young_gc,
            self.last_full_gc,
        );
        out.push(row);
    }
}

impl TableRow for NodeReport {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::SlowReport,
        columns: &[
            "timestamp",
            "trace_id",
            "entry_service",
            "entry_url",
            "entry_span_id",
            "mutated_service",
            "mutated_url",
            "mutated_pid",
            "mutated_span_id",
            "cause",
            "duration",
            "is_drop",
            "data",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(256 + self.data.len());
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', '{}', '{}', '{}', {}, '{}', '{}', {}, {}, '{}')",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(&self.entry_service),
            escape_sql(&self.entry_url),
            escape_sql(&self.entry_span_id),
            escape_sql(&self.mutated_service),
            escape_sql(&self.mutated_url),
            self.mutated_pid,
            escape_sql(&self.mutated_span_id),
            escape_sql(&self.cause),
            self.duration_ns,
            self.is_drop,
            escape_sql(&self.data),
        );
        out.push(row);
    }
}

impl TableRow for ErrorReport {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ErrorReport,
        columns: &[
            "timestamp",
            "trace_id",
            "entry_service",
            "entry_url",
            "entry_span_id",
            "is_drop",
            "cause",
            "data",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let (service, url, span_id) = self.join_keys().unwrap_or_default();
        let mut row = String::with_capacity(192 + self.data.len());
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', '{}', {}, '{}', '{}')",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(service),
            escape_sql(url),
            escape_sql(span_id),
            self.is_drop,
            escape_sql(&self.cause),
            escape_sql(&self.data),
        );
        out.push(row);
    }
}

impl TableRow for ErrorPropagation {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ErrorPropagation,
        columns: &[
            "timestamp",
            "entry_service",
            "entry_url",
            "entry_span_id",
            "trace_id",
            "nodes.service",
            "nodes.instance",
            "nodes.url",
            "nodes.is_traced",
            "nodes.is_error",
            "nodes.error_types",
            "nodes.error_msgs",
            "nodes.depth",
            "nodes.path",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let column = |f: fn(&crate::model::PropagationNode) -> &str| -> String {
            format_str_array(self.nodes.iter().map(f))
        };
        let flags = |f: fn(&crate::model::PropagationNode) -> bool| -> String {
            format_display_array(self.nodes.iter().map(f))
        };

        let mut row = String::with_capacity(256 + self.nodes.len() * 64);
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', '{}', {}, {}, {}, {}, {}, {}, {}, {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.entry_service),
            escape_sql(&self.entry_url),
            escape_sql(&self.entry_span_id),
            escape_sql(&self.trace_id),
            column(|n| n.service.as_str()),
            column(|n| n.instance.as_str()),
            column(|n| n.url.as_str()),
            flags(|n| n.is_traced),
            flags(|n| n.is_error),
            column(|n| n.error_types.as_str()),
            column(|n| n.error_msgs.as_str()),
            format_display_array(self.nodes.iter().map(|n| n.depth)),
            column(|n| n.path.as_str()),
        );
        out.push(row);
    }
}

impl TableRow for SlowReportCountMetric {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ReportMetric,
        columns: &[
            "timestamp",
            "entry_service",
            "entry_url",
            "mutated_service",
            "mutated_pid",
            "mutated_url",
            "total",
            "success",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(160);
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', {}, '{}', {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.entry_service),
            escape_sql(&self.entry_url),
            escape_sql(&self.mutated_service),
            self.mutated_pid,
            escape_sql(&self.mutated_url),
            self.total,
            self.success,
        );
        out.push(row);
    }
}

impl TableRow for OnOffMetric {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::OnOffMetric,
        columns: &[
            "timestamp",
            "trace_id",
            "apm_span_id",
            "pid",
            "tid",
            "cpu",
            "futex",
            "net",
            "file",
            "epoll",
            "runq",
            "other",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(160);
        let _ = write!(
            row,
            "({}, '{}', '{}', {}, {}, {}, {}, {}, {}, {}, {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(&self.apm_span_id),
            self.pid,
            self.tid,
            self.cpu_ns,
            self.futex_ns,
            self.net_ns,
            self.file_ns,
            self.epoll_ns,
            self.runq_ns,
            self.other_ns,
        );
        out.push(row);
    }
}

impl TableRow for Relation {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ServiceRelationship,
        columns: &[
            "timestamp",
            "entry_service",
            "entry_url",
            "miss_top",
            "trace_id",
            "parent_service",
            "parent_url",
            "service",
            "url",
            "path",
            "labels",
            "flags",
        ],
    };

    /// One row per parent to child edge.
    fn encode_rows(&self, out: &mut Vec<String>) {
        let timestamp = format_datetime64(self.root.start_time_ns);
        for edge in self.collect_relationships() {
            let mut labels = BTreeMap::new();
            labels.insert("client_group", edge.client_group.as_str());
            labels.insert("client_type", edge.client_type.as_str());
            labels.insert("client_peer", edge.client_peer.as_str());
            labels.insert("client_key", edge.client_key.as_str());

            let mut row = String::with_capacity(320);
            let _ = write!(
                row,
                "({}, '{}', '{}', {}, '{}', '{}', '{}', '{}', '{}', '{}', {}, {{'parent_traced': {}, 'is_async': {}, 'is_traced': {}}})",
                timestamp,
                escape_sql(&self.root.service_name),
                escape_sql(&self.root.url),
                self.miss_top(),
                escape_sql(&self.trace_id),
                escape_sql(&edge.parent_service),
                escape_sql(&edge.parent_url),
                escape_sql(&edge.service),
                escape_sql(&edge.url),
                escape_sql(&edge.path),
                format_str_map(labels.iter().map(|(k, v)| (*k, *v))),
                edge.parent_traced,
                edge.is_async,
                edge.is_traced,
            );
            out.push(row);
        }
    }
}

impl TableRow for AgentEvent {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::AgentEvent,
        columns: &["timestamp", "name", "pid", "labels", "status"],
    };

    /// Events whose timestamp is not a representable second are skipped.
    fn encode_rows(&self, out: &mut Vec<String>) {
        let Some(timestamp) = format_datetime(self.timestamp_s) else {
            tracing::warn!(
                timestamp_s = self.timestamp_s,
                name = %self.name,
                pid = self.pid,
                "agent event timestamp out of range, skipped"
            );
            return;
        };

        let mut row = String::with_capacity(128);
        let _ = write!(
            row,
            "({}, '{}', {}, {}, {})",
            timestamp,
            escape_sql(&self.name),
            self.pid,
            format_string_map(&self.labels),
            self.status,
        );
        out.push(row);
    }
}

impl TableRow for ServiceClient {
    const TABLE: TableDef = TableDef {
        kind: RecordKind::ServiceClient,
        columns: &[
            "timestamp",
            "trace_id",
            "service",
            "url",
            "client_group",
            "client_type",
            "client_peer",
            "client_key",
            "duration",
            "is_error",
        ],
    };

    fn encode_rows(&self, out: &mut Vec<String>) {
        let mut row = String::with_capacity(192);
        let _ = write!(
            row,
            "({}, '{}', '{}', '{}', '{}', '{}', '{}', '{}', {}, {})",
            format_datetime64(self.timestamp_ns),
            escape_sql(&self.trace_id),
            escape_sql(&self.service),
            escape_sql(&self.url),
            escape_sql(&self.client_group),
            escape_sql(&self.client_type),
            escape_sql(&self.client_peer),
            escape_sql(&self.client_key),
            self.duration_ns,
            self.is_error,
        );
        out.push(row);
    }
}

// --- SQL value formatting ---

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Formats seconds since the epoch as a DateTime literal, or `None` when
/// the value is outside chrono's range.
fn format_datetime(secs: u64) -> Option<String> {
    let secs = i64::try_from(secs).ok()?;
    let dt = DateTime::<Utc>::from_timestamp(secs, 0)?;
    Some(format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S")))
}

/// Formats nanoseconds since the epoch as a DateTime64(9) literal.
///
/// Every `u64` nanosecond count lies within chrono's range; the epoch
/// fallback is never taken.
fn format_datetime64(ns: u64) -> String {
    let secs = (ns / NANOS_PER_SEC) as i64;
    let nanos = (ns % NANOS_PER_SEC) as u32;
    let dt = DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.9f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
pub(crate) fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Escapes a backquoted identifier.
pub(crate) fn escape_identifier(s: &str) -> String {
    s.replace('\\', "\\\\").replace('`', "\\`")
}

fn format_string_array(values: &[String]) -> String {
    format_str_array(values.iter().map(String::as_str))
}

fn format_str_array<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::with_capacity(64);
    out.push('[');
    for (idx, value) in values.enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let escaped = escape_sql(value);
        let _ = write!(out, "'{escaped}'");
    }
    out.push(']');
    out
}

fn format_display_array<T: std::fmt::Display>(values: impl Iterator<Item = T>) -> String {
    let mut out = String::with_capacity(32);
    out.push('[');
    for (idx, value) in values.enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{value}");
    }
    out.push(']');
    out
}

fn format_string_map(map: &BTreeMap<String, String>) -> String {
    format_str_map(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

fn format_str_map<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::with_capacity(64);
    out.push('{');
    for (idx, (key, value)) in entries.enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "'{}': '{}'", escape_sql(key), escape_sql(value));
    }
    out.push('}');
    out
}
