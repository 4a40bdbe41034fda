use crate::error::ReportError;
use crate::events::{HealthReport, HealthState};
use log::{debug, error, info, warn};
use reqwest::Client;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::task::TaskTracker;

/// Longest report message delivered, in bytes
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Destination for health reports
///
/// Delivery is fire-and-forget: a sink never fails the cycle that produced the
/// report.
#[cfg_attr(test, mockall::automock)]
pub trait HealthReportSink: Send + Sync {
    fn report(&self, report: &HealthReport);

    /// Wait until reports handed over so far have been delivered or have failed
    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(std::future::ready(()))
    }
}

/// Sink that writes reports to the log and keeps the most recent ones
#[derive(Debug)]
pub struct LogHealthReporter {
    recent: Mutex<VecDeque<HealthReport>>,
    max_retained: usize,
}

impl Default for LogHealthReporter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LogHealthReporter {
    pub fn new(max_retained: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            max_retained,
        }
    }

    /// Reports delivered so far, oldest first
    pub fn recent(&self) -> Vec<HealthReport> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut recent) = self.recent.lock() {
            recent.clear();
        }
    }
}

impl HealthReportSink for LogHealthReporter {
    fn report(&self, report: &HealthReport) {
        match report.state {
            HealthState::Error => error!(
                "[{}] {}: {} (ttl {}s)",
                report.source,
                report.property,
                report.message,
                report.ttl.as_secs()
            ),
            HealthState::Warning => warn!(
                "[{}] {}: {} (ttl {}s)",
                report.source,
                report.property,
                report.message,
                report.ttl.as_secs()
            ),
            HealthState::Ok | HealthState::Unknown => info!(
                "[{}] {}: {}",
                report.source, report.property, report.message
            ),
        }

        if self.max_retained == 0 {
            return;
        }
        if let Ok(mut recent) = self.recent.lock() {
            while recent.len() >= self.max_retained {
                recent.pop_front();
            }
            recent.push_back(report.clone());
        }
    }
}

/// Sink that POSTs each report as JSON to a health endpoint
///
/// Requests run on the current tokio runtime in the background and are tracked
/// until `flush` returns. Failures are logged and the report is dropped.
pub struct HttpHealthReporter {
    client: Client,
    endpoint: String,
    in_flight: TaskTracker,
}

impl HttpHealthReporter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ReportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            in_flight: TaskTracker::new(),
        })
    }

    async fn deliver(client: Client, endpoint: String, report: HealthReport) -> Result<(), ReportError> {
        let response = client.post(&endpoint).json(&report).send().await?;
        if !response.status().is_success() {
            return Err(ReportError::DeliveryFailed(format!(
                "{} returned {}",
                endpoint,
                response.status()
            )));
        }
        Ok(())
    }
}

impl HealthReportSink for HttpHealthReporter {
    fn report(&self, report: &HealthReport) {
        let mut report = report.clone();
        report.message = truncate_text(&report.message, MAX_MESSAGE_LENGTH);

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No async runtime available, dropping report for {}",
                    report.property
                );
                return;
            }
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        self.in_flight.spawn_on(
            async move {
                let property = report.property.clone();
                match Self::deliver(client, endpoint, report).await {
                    Ok(()) => debug!("Delivered health report for {}", property),
                    Err(e) => error!("Failed to deliver health report for {}: {}", property, e),
                }
            },
            &handle,
        );
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let in_flight = self.in_flight.clone();
        Box::pin(async move {
            if !in_flight.is_empty() {
                debug!("Waiting for {} health report(s) in flight", in_flight.len());
            }
            in_flight.close();
            in_flight.wait().await;
            in_flight.reopen();
        })
    }
}

/// Truncate text to `max_length` bytes on a UTF-8 boundary, marking the cut with `...`
fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }
    let mut cut = max_length.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(property: &str, state: HealthState) -> HealthReport {
        HealthReport {
            source: "SystemServicesObserver".to_string(),
            node_name: "node-0".to_string(),
            property: property.to_string(),
            message: format!("{} is {}", property, state),
            state,
            ttl: Duration::from_secs(30),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_log_reporter_retains_recent_reports() {
        let reporter = LogHealthReporter::new(2);
        reporter.report(&report("a", HealthState::Ok));
        reporter.report(&report("b", HealthState::Warning));
        reporter.report(&report("c", HealthState::Error));

        let recent = reporter.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].property, "b");
        assert_eq!(recent[1].property, "c");

        reporter.clear();
        assert!(reporter.recent().is_empty());
    }

    #[test]
    fn test_log_reporter_with_zero_capacity_keeps_nothing() {
        let reporter = LogHealthReporter::new(0);
        reporter.report(&report("a", HealthState::Warning));
        assert!(reporter.recent().is_empty());
    }

    #[tokio::test]
    async fn test_log_reporter_flush_is_immediate() {
        LogHealthReporter::default().flush().await;
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("Hello, World!", 8), "Hello...");
        // 'é' is two bytes; the cut must not split it
        let truncated = truncate_text("ééééé", 6);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 6);
    }

    #[test]
    fn test_http_reporter_without_runtime_does_not_panic() {
        let reporter =
            HttpHealthReporter::new("http://127.0.0.1:9/report", Duration::from_secs(1)).unwrap();
        reporter.report(&report("a", HealthState::Ok));
    }

    #[tokio::test]
    async fn test_http_delivery_failure_is_reported() {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let result = HttpHealthReporter::deliver(
            client,
            "http://127.0.0.1:9/report".to_string(),
            report("a", HealthState::Error),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_http_reporter_flush_waits_for_deliveries() {
        let reporter = HttpHealthReporter::new(
            "http://127.0.0.1:9/report",
            Duration::from_secs(2),
        )
        .unwrap();
        reporter.report(&report("a", HealthState::Error));
        reporter.report(&report("b", HealthState::Warning));
        assert_eq!(reporter.in_flight.len(), 2);

        reporter.flush().await;
        assert!(reporter.in_flight.is_empty());

        reporter.report(&report("c", HealthState::Error));
        reporter.flush().await;
        assert!(reporter.in_flight.is_empty());
    }

    #[test]
    fn test_mock_sink_receives_report() {
        let mut sink = MockHealthReportSink::new();
        sink.expect_report()
            .withf(|r| r.state == HealthState::Error)
            .times(1)
            .return_const(());
        sink.report(&report("x", HealthState::Error));
    }
}
