use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use nodewatch::alerts::{
    CsvMetricStore, HealthReportSink, HttpHealthReporter, LogHealthReporter, MetricStore,
    TeeMetricStore, TelemetryMetricStore,
};
use nodewatch::collectors::{
    ClusterHealthSource, EventLogReader, HttpClusterHealth, JsonLinesEventLog, ProcNetPorts,
    SysinfoProbe,
};
use nodewatch::config::Config;
use nodewatch::error::{ConfigError, ObserverError};
use nodewatch::monitoring::{AgentStats, CycleResult};
use nodewatch::observer::{Collaborators, CycleOutcome, ObservationCycle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Command-line arguments for the node health agent
#[derive(Parser)]
#[command(
    name = "nodewatch",
    about = "Node-local health agent for cluster system services",
    long_about = "Periodically samples CPU, memory, disk I/O and port usage of the cluster's \
                  system-service processes, evaluates them against warning and error thresholds \
                  and emits health reports."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Run a single observation cycle and exit
    #[arg(long)]
    once: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing config files are allowed; they fall back to defaults in `load_config`.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Config path as UTF-8, if one was given
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }
}

/// Load configuration, falling back to defaults when the file is missing
///
/// An invalid file is an error: running with silently different thresholds would
/// report the wrong health.
fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match Config::from_file(std::path::Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(e)) => {
                    warn!("Configuration file not readable ({}), using defaults", e);
                    Ok(Config::default())
                }
                Err(e) => Err(e),
            }
        }
        None => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Wire up collaborators described by the configuration
fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let timeout = Duration::from_secs(config.cluster.timeout_seconds);

    let reporter: Arc<dyn HealthReportSink> = match &config.reporting.health_endpoint {
        Some(endpoint) => {
            info!("Delivering health reports to {}", endpoint);
            Arc::new(
                HttpHealthReporter::new(endpoint.clone(), timeout)
                    .context("creating health report client")?,
            )
        }
        None => Arc::new(LogHealthReporter::default()),
    };

    let cluster: Option<Arc<dyn ClusterHealthSource>> = match &config.cluster.health_endpoint {
        Some(endpoint) => Some(Arc::new(
            HttpClusterHealth::new(endpoint.clone(), timeout)
                .context("creating cluster health client")?,
        )),
        None => {
            debug!("No cluster health endpoint, cluster gate disabled");
            None
        }
    };

    let mut stores: Vec<Arc<dyn MetricStore>> = Vec::new();
    if config.data_log.csv_enabled {
        stores.push(Arc::new(CsvMetricStore::new(config.data_log.folder.clone())));
    }
    if config.data_log.telemetry_enabled {
        stores.push(Arc::new(TelemetryMetricStore));
    }
    let metric_store: Option<Arc<dyn MetricStore>> = match stores.len() {
        0 => None,
        1 => stores.pop(),
        _ => Some(Arc::new(TeeMetricStore::new(stores))),
    };

    let event_log: Option<Arc<dyn EventLogReader>> = if config.event_log.enabled {
        Some(Arc::new(JsonLinesEventLog::new(
            config.event_log.directory.clone(),
        )))
    } else {
        None
    };

    Ok(Collaborators {
        probe: Arc::new(SysinfoProbe::new()),
        ports: Arc::new(ProcNetPorts::new()),
        reporter,
        cluster,
        metric_store,
        event_log,
    })
}

#[cfg(unix)]
fn log_privilege_level() {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        info!(
            "Running without elevated privileges (euid {}); processes of other users will be skipped",
            euid
        );
    }
}

#[cfg(not(unix))]
fn log_privilege_level() {}

/// Run cycles until shutdown, or once
async fn run(config: Config, once: bool, shutdown: CancellationToken) -> anyhow::Result<()> {
    let collaborators = build_collaborators(&config)?;
    let reporter = Arc::clone(&collaborators.reporter);
    let mut observer = ObservationCycle::new(&config, collaborators);
    let stats = AgentStats::default();
    let interval = Duration::from_secs(config.agent.run_interval_seconds);

    info!(
        "Watching {} process(es) on {} every {}s",
        config.agent.processes.len(),
        config.agent.node_name,
        interval.as_secs()
    );

    loop {
        let cycle_cancel = shutdown.child_token();
        let started = Instant::now();
        let result = observer.run(&cycle_cancel).await;
        let elapsed = started.elapsed();

        match result {
            Ok(CycleOutcome::Completed(summary)) => {
                info!(
                    "Cycle completed in {:?}: {} verdict(s), {} alarm(s), {} instance(s) skipped",
                    summary.runtime,
                    summary.verdicts.len(),
                    summary.alarms().count(),
                    summary.skipped_instances
                );
                stats.record_cycle(CycleResult::Completed, elapsed);
            }
            Ok(CycleOutcome::Abandoned) => {
                stats.record_cycle(CycleResult::Abandoned, elapsed);
            }
            Err(ObserverError::Cancelled) => {
                info!("Observation cycle cancelled");
                stats.record_cycle(CycleResult::Cancelled, elapsed);
            }
            Err(e) => {
                error!("Observation cycle failed: {}", e);
                stats.record_cycle(CycleResult::Failed, elapsed);
            }
        }
        stats.log_summary();

        if once || shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    reporter.flush().await;
    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting nodewatch");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    log_privilege_level();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal.cancel();
    }) {
        error!("Failed to install interrupt handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config, cli.once, shutdown).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodewatch::events::StatKind;
    use tempfile::TempDir;

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            verbose: false,
            once: false,
        }
    }

    #[test]
    fn test_cli_validation_with_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodewatch.toml");
        std::fs::write(&path, "[agent]\nnode_name = \"node-0\"").unwrap();

        assert!(cli(Some(path)).validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        assert!(cli(Some(PathBuf::from("/nonexistent/config.toml")))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        assert!(cli(Some(dir.path().to_path_buf())).validate().is_err());
    }

    #[test]
    fn test_cli_validation_no_config() {
        assert!(cli(None).validate().is_ok());
    }

    #[test]
    fn test_config_path_str_with_valid_path() {
        let cli = cli(Some(PathBuf::from("config.toml")));
        assert_eq!(cli.config_path_str().unwrap(), Some("config.toml"));
    }

    #[test]
    fn test_config_path_str_no_config() {
        assert_eq!(cli(None).config_path_str().unwrap(), None);
    }

    #[test]
    fn test_cli_parses_once_flag() {
        let cli = Cli::parse_from(["nodewatch", "--once", "-c", "agent.toml"]);
        assert!(cli.once);
        assert_eq!(cli.config, Some(PathBuf::from("agent.toml")));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Some("/nonexistent/nodewatch.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_invalid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sampling]\ndelay_ms = 0\n").unwrap();

        assert!(load_config(path.to_str()).is_err());
    }

    #[test]
    fn test_build_collaborators_from_defaults() {
        let collaborators = build_collaborators(&Config::default()).unwrap();
        assert!(collaborators.cluster.is_none());
        assert!(collaborators.metric_store.is_none());
        assert!(collaborators.event_log.is_none());
    }

    #[test]
    fn test_build_collaborators_with_optional_services() {
        let mut config = Config::default();
        config.cluster.health_endpoint = Some("http://127.0.0.1:9/cluster".to_string());
        config.data_log.telemetry_enabled = true;
        config.event_log.enabled = true;

        let collaborators = build_collaborators(&config).unwrap();
        assert!(collaborators.cluster.is_some());
        assert!(collaborators.metric_store.is_some());
        assert!(collaborators.event_log.is_some());
    }

    #[test]
    fn test_build_collaborators_with_both_data_logs() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_log.csv_enabled = true;
        config.data_log.telemetry_enabled = true;
        config.data_log.folder = dir.path().join("data");

        let collaborators = build_collaborators(&config).unwrap();
        let store = collaborators.metric_store.unwrap();
        store
            .log_data("SystemServices_node-0", "gatewayd", "% CPU Time", StatKind::Average, 3.5)
            .unwrap();
        assert!(CsvMetricStore::new(dir.path().join("data"))
            .path_for("SystemServices_node-0")
            .exists());
    }

    #[tokio::test]
    async fn test_single_cycle_run_flushes_reports() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.agent.log_root = dir.path().to_path_buf();
        config.reporting.health_endpoint = Some("http://127.0.0.1:9/report".to_string());
        config.cluster.timeout_seconds = 1;

        assert!(run(config, true, CancellationToken::new()).await.is_ok());
    }
}
