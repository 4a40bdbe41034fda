/// Error types for the agent
pub mod error;

/// Shared value types: health states, reports, metric kinds, event records
pub mod events;

/// Configuration management
pub mod config;

/// Bounded sample series per watched process and metric
pub mod aggregator;

/// Process sampling, port usage, cluster health and event-log harvesting
pub mod collectors;

/// Threshold evaluation and the cluster health gate
pub mod triggers;

/// Health report sinks and the metric store
pub mod alerts;

/// Cycle timing and agent self-monitoring
pub mod monitoring;

/// Observation cycle controller
pub mod observer;

// Re-export commonly used types
pub use error::{ConfigError, ObserverError, ProbeError, SeriesError};
pub use observer::{Collaborators, CycleOutcome, ObservationCycle};
