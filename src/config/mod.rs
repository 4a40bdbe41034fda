//! Agent configuration
//!
//! Loaded from a TOML file. Every section falls back to its defaults, so a partial
//! file (or no file at all) yields a usable configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub thresholds: ThresholdConfig,
    pub sampling: SamplingConfig,
    pub cluster: ClusterConfig,
    pub event_log: EventLogConfig,
    pub reporting: ReportingConfig,
    pub data_log: DataLogConfig,
}

/// Identity, schedule and the watched process roster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    pub observer_name: String,
    pub run_interval_seconds: u64,
    /// Directory holding agent artifacts such as the event-log summary
    pub log_root: PathBuf,
    /// Watched process roster, sampled in this order
    pub processes: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            observer_name: "SystemServicesObserver".to_string(),
            run_interval_seconds: 60,
            log_root: PathBuf::from("observer_logs"),
            processes: [
                "Fabric",
                "FabricApplicationGateway",
                "FabricCAS",
                "FabricDCA",
                "FabricDnsService",
                "FabricGateway",
                "FabricHost",
                "FabricIS",
                "FabricRM",
                "FabricUS",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Warning/error limits per metric family; zero disables a limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdConfig {
    pub cpu_error_pct: f64,
    pub cpu_warn_pct: f64,
    pub memory_error_mb: f64,
    pub memory_warn_mb: f64,
    pub disk_read_error_ops: f64,
    pub disk_read_warn_ops: f64,
    pub disk_write_error_ops: f64,
    pub disk_write_warn_ops: f64,
    pub unhealthy_nodes_error_pct: u32,
    pub unhealthy_nodes_warn_pct: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_error_pct: 90.0,
            cpu_warn_pct: 70.0,
            memory_error_mb: 15000.0,
            memory_warn_mb: 14000.0,
            disk_read_error_ops: 0.0,
            disk_read_warn_ops: 20000.0,
            disk_write_error_ops: 0.0,
            disk_write_warn_ops: 20000.0,
            unhealthy_nodes_error_pct: 0,
            unhealthy_nodes_warn_pct: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    pub delay_ms: u64,
    /// Per-instance sample budget; 0 means one sample per processing unit
    pub max_samples_per_instance: usize,
    /// Upper bound on samples retained by one series
    pub series_capacity: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            delay_ms: 250,
            max_samples_per_instance: 0,
            series_capacity: 10_000,
        }
    }
}

impl SamplingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Effective per-instance budget
    pub fn sample_budget(&self) -> usize {
        if self.max_samples_per_instance > 0 {
            return self.max_samples_per_instance;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster-health endpoint; the gate is skipped when unset
    pub health_endpoint: Option<String>,
    pub timeout_seconds: u64,
    /// Clusters with this many nodes or fewer are not gated
    pub min_nodes_for_gate: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health_endpoint: None,
            timeout_seconds: 30,
            min_nodes_for_gate: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Directory of `<source>.jsonl` files
    pub directory: PathBuf,
    /// Sources, drained in this order
    pub sources: Vec<String>,
    pub window_hours: i64,
    pub display_threshold: usize,
}

/// Longest trailing window an event-log query may cover (ten years)
pub const MAX_EVENT_WINDOW_HOURS: i64 = 24 * 365 * 10;

impl EventLogConfig {
    /// Trailing query window, clamped to `1..=MAX_EVENT_WINDOW_HOURS` hours
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.window_hours.clamp(1, MAX_EVENT_WINDOW_HOURS))
            .unwrap_or_else(|| chrono::Duration::hours(24))
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("event_logs"),
            sources: [
                "Microsoft-ServiceFabric/Admin",
                "Microsoft-ServiceFabric/Operational",
                "Microsoft-ServiceFabric-Lease/Admin",
                "Microsoft-ServiceFabric-Lease/Operational",
                "System",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            window_hours: 24,
            display_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportingConfig {
    pub ttl_multiplier: u32,
    pub ttl_padding_seconds: u64,
    /// Health-report endpoint; reports are logged when unset
    pub health_endpoint: Option<String>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            ttl_multiplier: 3,
            ttl_padding_seconds: 0,
            health_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataLogConfig {
    pub csv_enabled: bool,
    pub telemetry_enabled: bool,
    pub folder: PathBuf,
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            csv_enabled: false,
            telemetry_enabled: false,
            folder: PathBuf::from("observer_logs/data"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, a parse error for
    /// malformed TOML, and `ConfigError::ValidationError` for out-of-range values.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the agent misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.processes.is_empty() {
            return Err(ConfigError::ValidationError(
                "agent.processes must name at least one process".to_string(),
            ));
        }
        if self.agent.processes.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "agent.processes contains an empty name".to_string(),
            ));
        }
        if self.agent.run_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "agent.run_interval_seconds must be greater than 0".to_string(),
            ));
        }

        let t = &self.thresholds;
        let pairs = [
            ("cpu", t.cpu_warn_pct, t.cpu_error_pct),
            ("memory", t.memory_warn_mb, t.memory_error_mb),
            ("disk_read", t.disk_read_warn_ops, t.disk_read_error_ops),
            ("disk_write", t.disk_write_warn_ops, t.disk_write_error_ops),
        ];
        for (name, warn, error) in pairs {
            if warn > 0.0 && error > 0.0 && warn > error {
                return Err(ConfigError::ValidationError(format!(
                    "{} warning threshold {} exceeds error threshold {}",
                    name, warn, error
                )));
            }
        }
        if t.cpu_error_pct > 100.0 || t.cpu_warn_pct > 100.0 {
            return Err(ConfigError::ValidationError(
                "cpu thresholds are percentages and must not exceed 100".to_string(),
            ));
        }
        if t.unhealthy_nodes_error_pct > 100 || t.unhealthy_nodes_warn_pct > 100 {
            return Err(ConfigError::ValidationError(
                "unhealthy node thresholds must not exceed 100".to_string(),
            ));
        }

        if self.sampling.delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sampling.delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.sampling.series_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "sampling.series_capacity must be greater than 0".to_string(),
            ));
        }
        if self.event_log.display_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "event_log.display_threshold must be greater than 0".to_string(),
            ));
        }
        if self.event_log.window_hours <= 0 {
            return Err(ConfigError::ValidationError(
                "event_log.window_hours must be greater than 0".to_string(),
            ));
        }
        if self.event_log.window_hours > MAX_EVENT_WINDOW_HOURS {
            return Err(ConfigError::ValidationError(format!(
                "event_log.window_hours must not exceed {}",
                MAX_EVENT_WINDOW_HOURS
            )));
        }

        Ok(())
    }
}
