use std::collections::BTreeMap;

/// Agent lifecycle event, e.g. instrumentation attaching to or detaching from a
/// process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentEvent {
    /// Seconds since the Unix epoch.
    pub timestamp_s: u64,
    pub name: String,
    pub pid: u32,
    pub labels: BTreeMap<String, String>,
    pub status: bool,
}

/// Trigger and success counts of one slow-report tuple over a collection
/// interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlowReportCountMetric {
    pub timestamp_ns: u64,
    pub entry_service: String,
    pub entry_url: String,
    pub mutated_service: String,
    pub mutated_pid: u32,
    pub mutated_url: String,
    pub total: u64,
    pub success: u64,
}

impl SlowReportCountMetric {
    /// Number of triggered profiles that produced nothing.
    pub fn failed(&self) -> u64 {
        self.total.saturating_sub(self.success)
    }
}
