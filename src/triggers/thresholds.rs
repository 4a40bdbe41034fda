//! Threshold policies and the evaluator that turns series into verdicts
//!
//! Each metric family carries an error and a warning limit. A limit of zero (or
//! below) is disabled. Values are tested against the error limit first; reaching a
//! limit counts as exceeding it.

use crate::aggregator::SampleSeries;
use crate::alerts::MetricStore;
use crate::config::ThresholdConfig;
use crate::events::{HealthReport, HealthState, MetricKind, StatKind};
use chrono::Utc;
use log::{debug, warn};
use std::time::Duration;

/// Warning and error limits for one metric family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub metric: MetricKind,
    pub error_limit: f64,
    pub warn_limit: f64,
}

impl ThresholdPolicy {
    pub fn new(metric: MetricKind, error_limit: f64, warn_limit: f64) -> Self {
        Self {
            metric,
            error_limit,
            warn_limit,
        }
    }

    /// Build the four family policies from configuration, in reporting order
    pub fn from_config(thresholds: &ThresholdConfig) -> Vec<ThresholdPolicy> {
        MetricKind::ALL
            .iter()
            .map(|&metric| {
                let (error, warn) = match metric {
                    MetricKind::Cpu => (thresholds.cpu_error_pct, thresholds.cpu_warn_pct),
                    MetricKind::Memory => (thresholds.memory_error_mb, thresholds.memory_warn_mb),
                    MetricKind::DiskRead => {
                        (thresholds.disk_read_error_ops, thresholds.disk_read_warn_ops)
                    }
                    MetricKind::DiskWrite => {
                        (thresholds.disk_write_error_ops, thresholds.disk_write_warn_ops)
                    }
                };
                ThresholdPolicy::new(metric, error, warn)
            })
            .collect()
    }

    pub fn error_enabled(&self) -> bool {
        self.error_limit > 0.0
    }

    pub fn warn_enabled(&self) -> bool {
        self.warn_limit > 0.0
    }

    /// Whether this family is evaluated at all
    pub fn is_enabled(&self) -> bool {
        self.error_enabled() || self.warn_enabled()
    }

    /// Map a value to a health state, error limit first
    pub fn classify(&self, value: f64) -> HealthState {
        if self.error_enabled() && value >= self.error_limit {
            HealthState::Error
        } else if self.warn_enabled() && value >= self.warn_limit {
            HealthState::Warning
        } else {
            HealthState::Ok
        }
    }
}

/// Derives report time-to-live from the elapsed cycle runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub multiplier: u32,
    pub padding: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            multiplier: 3,
            padding: Duration::ZERO,
        }
    }
}

impl TtlPolicy {
    pub fn new(multiplier: u32, padding: Duration) -> Self {
        Self {
            multiplier,
            padding,
        }
    }

    /// `runtime_seconds * multiplier + padding`, using whole elapsed seconds
    pub fn ttl_for(&self, runtime: Duration) -> Duration {
        Duration::from_secs(runtime.as_secs().saturating_mul(u64::from(self.multiplier)))
            + self.padding
    }
}

/// Result of evaluating one series against its policy
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Watched entity the series belongs to
    pub entity: String,
    pub metric: MetricKind,
    pub state: HealthState,
    /// Aggregated value that produced the state
    pub value: f64,
    pub ttl: Duration,
}

impl Verdict {
    /// Health report for this verdict
    pub fn to_report(&self, source: &str, node_name: &str, policy: &ThresholdPolicy) -> HealthReport {
        let message = match self.state {
            HealthState::Error => format!(
                "{} average {} is {:.2}{}, at or above error limit {}{}",
                self.entity,
                self.metric,
                self.value,
                self.metric.unit(),
                policy.error_limit,
                self.metric.unit()
            ),
            HealthState::Warning => format!(
                "{} average {} is {:.2}{}, at or above warning limit {}{}",
                self.entity,
                self.metric,
                self.value,
                self.metric.unit(),
                policy.warn_limit,
                self.metric.unit()
            ),
            _ => format!(
                "{} average {} is {:.2}{}",
                self.entity,
                self.metric,
                self.value,
                self.metric.unit()
            ),
        };

        HealthReport {
            source: source.to_string(),
            node_name: node_name.to_string(),
            property: format!("{} {}", self.entity, self.metric.display_label()),
            message,
            state: self.state,
            ttl: self.ttl,
            timestamp: Utc::now(),
        }
    }
}

/// Evaluates series against threshold policies
///
/// When a metric store is attached, the average and peak of every evaluated series
/// are persisted before its verdict is produced, whatever the verdict.
pub struct ThresholdEvaluator<'a> {
    store: Option<&'a dyn MetricStore>,
    series_file: String,
}

impl<'a> ThresholdEvaluator<'a> {
    pub fn new(store: Option<&'a dyn MetricStore>, series_file: impl Into<String>) -> Self {
        Self {
            store,
            series_file: series_file.into(),
        }
    }

    /// Evaluate one series; `None` means the series was skipped
    pub fn evaluate(
        &self,
        series: &SampleSeries,
        policy: &ThresholdPolicy,
        ttl: Duration,
    ) -> Option<Verdict> {
        if !policy.is_enabled() {
            return None;
        }

        let average = match series.average() {
            Some(average) if average >= 0.0 => average,
            _ => {
                debug!(
                    "Skipping {} {}: no usable samples",
                    series.name(),
                    series.metric()
                );
                return None;
            }
        };

        if let Some(store) = self.store {
            let peak = series.peak().unwrap_or(average);
            self.persist(store, series, StatKind::Average, round_to(average, 2));
            self.persist(store, series, StatKind::Peak, peak.round());
        }

        Some(Verdict {
            entity: series.name().to_string(),
            metric: series.metric(),
            state: policy.classify(average),
            value: average,
            ttl,
        })
    }

    fn persist(&self, store: &dyn MetricStore, series: &SampleSeries, stat: StatKind, value: f64) {
        if let Err(e) = store.log_data(
            &self.series_file,
            series.name(),
            series.metric().data_label(),
            stat,
            value,
        ) {
            warn!(
                "Failed to persist {} {} for {}: {}",
                stat,
                series.metric(),
                series.name(),
                e
            );
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
