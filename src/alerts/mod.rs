/// Health report delivery
pub mod health_reporter;

/// Long-running storage of series statistics
pub mod metric_store;

pub use health_reporter::{HealthReportSink, HttpHealthReporter, LogHealthReporter};
pub use metric_store::{CsvMetricStore, MetricStore, TeeMetricStore, TelemetryMetricStore};

#[cfg(test)]
pub use health_reporter::MockHealthReportSink;
#[cfg(test)]
pub use metric_store::MockMetricStore;
