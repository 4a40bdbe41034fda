use crate::error::StoreError;
use crate::events::StatKind;
use chrono::Utc;
use log::{debug, info};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Long-running store for aggregated series statistics
#[cfg_attr(test, mockall::automock)]
pub trait MetricStore: Send + Sync {
    /// Record one statistic of an entity's metric in `series_file`
    fn log_data(
        &self,
        series_file: &str,
        entity: &str,
        metric: &str,
        stat: StatKind,
        value: f64,
    ) -> Result<(), StoreError>;
}

const CSV_HEADER: &str = "Date,Target,Metric,Stat,Value";

/// Appends statistics to `<folder>/<series_file>.csv`
pub struct CsvMetricStore {
    folder: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvMetricStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, series_file: &str) -> PathBuf {
        self.folder.join(format!("{}.csv", series_file))
    }

    fn append_row(path: &Path, row: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(file, "{}", row)?;
        Ok(())
    }
}

impl MetricStore for CsvMetricStore {
    fn log_data(
        &self,
        series_file: &str,
        entity: &str,
        metric: &str,
        stat: StatKind,
        value: f64,
    ) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::WriteFailed("data log lock poisoned".to_string()))?;

        let row = format!(
            "{},{},{},{},{}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            csv_field(entity),
            csv_field(metric),
            stat,
            value
        );
        let path = self.path_for(series_file);
        Self::append_row(&path, &row)?;
        debug!("Logged {} {} for {} to {}", stat, metric, entity, path.display());
        Ok(())
    }
}

/// Emits statistics as structured traces on the `telemetry` log target
#[derive(Debug, Default)]
pub struct TelemetryMetricStore;

impl MetricStore for TelemetryMetricStore {
    fn log_data(
        &self,
        series_file: &str,
        entity: &str,
        metric: &str,
        stat: StatKind,
        value: f64,
    ) -> Result<(), StoreError> {
        info!(
            target: "telemetry",
            "[{}] {}/{}/{}: {}",
            series_file, entity, metric, stat, value
        );
        Ok(())
    }
}

/// Writes every statistic to each of several stores
///
/// All stores are attempted; the first failure is returned.
pub struct TeeMetricStore {
    stores: Vec<Arc<dyn MetricStore>>,
}

impl TeeMetricStore {
    pub fn new(stores: Vec<Arc<dyn MetricStore>>) -> Self {
        Self { stores }
    }
}

impl MetricStore for TeeMetricStore {
    fn log_data(
        &self,
        series_file: &str,
        entity: &str,
        metric: &str,
        stat: StatKind,
        value: f64,
    ) -> Result<(), StoreError> {
        let mut first_error = None;
        for store in &self.stores {
            if let Err(e) = store.log_data(series_file, entity, metric, stat, value) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
