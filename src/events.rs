//! Core value types shared across the agent
//!
//! Health states and reports flowing to the health-report sink, the closed set of
//! metric families the sampler collects, and the structured event-log records the
//! harvester gathers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Outcome of comparing an aggregated value to its limits
///
/// `Unknown` means the evaluation could not complete (for example an upstream
/// timeout). It is not an alarm, but it is distinct from `Ok`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HealthState {
    Ok,
    Warning,
    Error,
    Unknown,
}

impl HealthState {
    /// Whether this state counts as an outstanding alarm
    pub fn is_alarm(self) -> bool {
        matches!(self, HealthState::Warning | HealthState::Error)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Ok => "Ok",
            HealthState::Warning => "Warning",
            HealthState::Error => "Error",
            HealthState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Metric families sampled for every watched process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Cpu,
    Memory,
    DiskRead,
    DiskWrite,
}

impl MetricKind {
    /// All families, in reporting order
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::DiskRead,
        MetricKind::DiskWrite,
    ];

    /// Label used as the health property and in log grouping
    pub fn display_label(self) -> &'static str {
        match self {
            MetricKind::Cpu => "CPU",
            MetricKind::Memory => "Memory",
            MetricKind::DiskRead => "Disk IO Reads",
            MetricKind::DiskWrite => "Disk IO Writes",
        }
    }

    /// Label used for rows in the long-running metric store
    pub fn data_label(self) -> &'static str {
        match self {
            MetricKind::Cpu => "% CPU Time",
            MetricKind::Memory => "Working Set (MB)",
            MetricKind::DiskRead => "Disk IO Reads/sec",
            MetricKind::DiskWrite => "Disk IO Writes/sec",
        }
    }

    /// Unit suffix appended to values in health messages
    pub fn unit(self) -> &'static str {
        match self {
            MetricKind::Cpu => "%",
            MetricKind::Memory => "MB",
            MetricKind::DiskRead | MetricKind::DiskWrite => "ops/sec",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_label())
    }
}

/// Statistic persisted to the metric store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatKind {
    Average,
    Peak,
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatKind::Average => f.write_str("Average"),
            StatKind::Peak => f.write_str("Peak"),
        }
    }
}

/// Health update handed to the health-report sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// Name of the reporting observer
    pub source: String,
    /// Node the agent runs on
    pub node_name: String,
    /// Health property, e.g. a metric family label or "Ports"
    pub property: String,
    /// Human-readable description
    pub message: String,
    /// Reported health state
    pub state: HealthState,
    /// Time after which the consumer may treat this report as stale
    pub ttl: Duration,
    /// When the report was produced
    pub timestamp: Timestamp,
}

/// Severity of an event-log record, ordered from most to least severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventLevel {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Information = 4,
    Verbose = 5,
}

impl EventLevel {
    /// Numeric level as used in event-log filter expressions
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            EventLevel::Critical => "Critical",
            EventLevel::Error => "Error",
            EventLevel::Warning => "Warning",
            EventLevel::Information => "Information",
            EventLevel::Verbose => "Verbose",
        }
    }
}

/// One structured event-log record
///
/// Equality covers every field, which is what harvest deduplication relies on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventRecord {
    /// Log source the record was read from
    pub log_name: String,
    pub level: EventLevel,
    pub time_created: Option<Timestamp>,
    /// Ordered property values; `None` for null values
    pub properties: Vec<Option<String>>,
}
