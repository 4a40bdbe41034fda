use thiserror::Error;

/// Errors that end or abandon an observation cycle
///
/// `TransientUpstream` is absorbed by the cluster gate as an `Unknown` verdict.
/// Privilege denials never get this far: the sampler skips the instance.
#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Observation cycle cancelled")]
    Cancelled,

    #[error("Transient upstream failure: {0}")]
    TransientUpstream(String),

    #[error("Fatal observer failure: {0}")]
    Fatal(String),

    #[error("Sample series error: {0}")]
    Series(#[from] SeriesError),
}

impl ObserverError {
    /// Failures the cycle recovers from without aborting
    pub fn is_transient(&self) -> bool {
        matches!(self, ObserverError::TransientUpstream(_))
    }
}

/// Errors raised by a sample series or the store that owns it
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeriesError {
    #[error("Invalid series state: {0}")]
    InvalidState(String),
}

/// Errors from the perf-counter and network-usage providers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Access denied to process {0}")]
    PermissionDenied(String),

    #[error("Process {0} has exited")]
    Exited(u32),

    #[error("Counter unavailable: {0}")]
    Other(String),
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e.to_string()),
            _ => ProbeError::Other(e.to_string()),
        }
    }
}

/// Errors from the cluster-health source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterQueryError {
    #[error("Cluster health query timed out")]
    Timeout,

    #[error("Transient cluster fault: {0}")]
    Transient(String),

    #[error("Cluster health query failed: {0}")]
    Other(String),
}

impl From<ClusterQueryError> for ObserverError {
    fn from(e: ClusterQueryError) -> Self {
        match e {
            ClusterQueryError::Timeout => ObserverError::TransientUpstream(e.to_string()),
            ClusterQueryError::Transient(_) => ObserverError::TransientUpstream(e.to_string()),
            ClusterQueryError::Other(_) => ObserverError::Fatal(e.to_string()),
        }
    }
}

/// Errors from the long-running metric store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write data log: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors from health-report delivery
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to deliver health report: {0}")]
    DeliveryFailed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
