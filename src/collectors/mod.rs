/// Cluster node health sources
pub mod cluster_health;

/// Event-log readers and the error-event harvester
pub mod event_log;

/// Per-process TCP port usage
pub mod ports;

/// Process discovery and perf counters
pub mod probe;

/// Bounded sampling of watched process instances
pub mod process_sampler;

pub use cluster_health::{ClusterHealthSource, HttpClusterHealth, NodeHealth};
pub use event_log::{EventLogHarvester, EventLogReader, EventQuery, JsonLinesEventLog};
pub use ports::{PortCounts, PortUsage, ProcNetPorts};
pub use probe::{IoDirection, ProcessProbe, SysinfoProbe};
pub use process_sampler::{ProcessSampler, SampleOutcome};
