//! Telemetry record types accepted from agents, plus the projections derived
//! from them at flush time.

pub mod event;
pub mod relation;
pub mod report;
pub mod trace;

pub use event::{AgentEvent, SlowReportCountMetric};
pub use relation::{Relation, Relationship, ServiceClient};
pub use report::{ClientCall, ErrorPropagation, ErrorReport, NodeReport, PropagationNode, RelationNode};
pub use trace::{FlameGraph, JvmGc, OnOffMetric, ProfilingEvent, SpanTrace};

/// Every kind of record written by the flush cycle, in flush order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    ProfilingEvent,
    FlameGraph,
    JvmGc,
    SpanTrace,
    SlowReport,
    ErrorReport,
    ErrorPropagation,
    ReportMetric,
    OnOffMetric,
    ServiceRelationship,
    AgentEvent,
    ServiceClient,
}

impl RecordKind {
    /// All kinds in the order a tenant flush writes them.
    pub const ALL: [RecordKind; 12] = [
        Self::ProfilingEvent,
        Self::FlameGraph,
        Self::JvmGc,
        Self::SpanTrace,
        Self::SlowReport,
        Self::ErrorReport,
        Self::ErrorPropagation,
        Self::ReportMetric,
        Self::OnOffMetric,
        Self::ServiceRelationship,
        Self::AgentEvent,
        Self::ServiceClient,
    ];

    /// Returns the label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProfilingEvent => "profiling_event",
            Self::FlameGraph => "flame_graph",
            Self::JvmGc => "jvm_gc",
            Self::SpanTrace => "span_trace",
            Self::SlowReport => "slow_report",
            Self::ErrorReport => "error_report",
            Self::ErrorPropagation => "error_propagation",
            Self::ReportMetric => "report_metric",
            Self::OnOffMetric => "onoff_metric",
            Self::ServiceRelationship => "service_relationship",
            Self::AgentEvent => "agent_event",
            Self::ServiceClient => "service_client",
        }
    }

    /// Returns the store table this kind is written to.
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::ReportMetric => "slow_report_count",
            Self::AgentEvent => "originx_agent_event",
            other => other.as_str(),
        }
    }

    /// Looks up a kind by its table name.
    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.table_name() == name)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_record_kind_labels_unique() {
        let labels: HashSet<&str> = RecordKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), RecordKind::ALL.len());
    }

    #[test]
    fn test_table_name_lookup() {
        assert_eq!(RecordKind::ReportMetric.table_name(), "slow_report_count");
        assert_eq!(
            RecordKind::from_table_name("originx_agent_event"),
            Some(RecordKind::AgentEvent)
        );
        assert_eq!(RecordKind::from_table_name("span_trace"), Some(RecordKind::SpanTrace));
        assert_eq!(RecordKind::from_table_name("agent_event"), None);
    }

    #[test]
    fn test_record_kind_display() {
        assert_eq!(RecordKind::ErrorPropagation.to_string(), "error_propagation");
    }
}
