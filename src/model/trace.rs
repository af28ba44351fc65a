use std::collections::BTreeMap;

/// One traced span group reported by an agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanTrace {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub apm_span_id: String,
    pub service_name: String,
    pub url: String,
    pub pid: u32,
    pub tid: u32,
    pub container_id: String,
    pub node_name: String,
    pub node_ip: String,
    pub start_time_ns: u64,
    pub end_time_ns: u64,
    pub duration_ns: u64,
    pub is_slow: bool,
    pub is_error: bool,
    pub is_profiled: bool,
    pub labels: BTreeMap<String, String>,
}

impl SpanTrace {
    /// Identifies the process that produced the span.
    pub fn instance_id(&self) -> String {
        if self.container_id.is_empty() {
            format!("{}@{}", self.pid, self.node_name)
        } else {
            format!("{}@{}", self.pid, self.container_id)
        }
    }
}

/// On-CPU/off-CPU event group captured while profiling one span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilingEvent {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub apm_span_id: String,
    pub node_name: String,
    pub pid: u32,
    pub tid: u32,
    pub start_time_ns: u64,
    pub end_time_ns: u64,
    /// Encoded events in capture order.
    pub events: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlameGraph {
    pub timestamp_ns: u64,
    pub start_time_ns: u64,
    pub end_time_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub sample_type: String,
    pub sample_rate: u32,
    pub labels: BTreeMap<String, String>,
    pub flame_bearer: String,
}

/// Cumulative JVM garbage collection counters of one process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JvmGc {
    pub timestamp_ns: u64,
    pub node_name: String,
    pub pid: u32,
    pub young_gc: u64,
    pub full_gc: u64,
    pub last_young_gc: u64,
    pub last_full_gc: u64,
}

/// Time a span spent in each on/off CPU state, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnOffMetric {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub apm_span_id: String,
    pub pid: u32,
    pub tid: u32,
    pub cpu_ns: u64,
    pub futex_ns: u64,
    pub net_ns: u64,
    pub file_ns: u64,
    pub epoll_ns: u64,
    pub runq_ns: u64,
    pub other_ns: u64,
}
