//! Bounded per-instance sampling of a watched process
//!
//! Every instance of a process name gets at most `budget` samples, one per
//! metric family per iteration, spaced by a fixed delay. Sampling an instance stops
//! early when it exits or the cycle is cancelled.

use super::ports::{PortCounts, PortUsage};
use super::probe::{IoDirection, ProcessProbe};
use crate::aggregator::SeriesStore;
use crate::error::{ObserverError, ProbeError};
use crate::events::MetricKind;
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why an instance contributed nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The agent may not read this instance's counters
    PrivilegeDenied(String),
    /// The instance exited before its first sample
    Exited,
}

/// Result of sampling one process instance
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Number of complete samples recorded
    Sampled(usize),
    Skipped(SkipReason),
    Failed(ProbeError),
}

/// One complete reading across the four metric families
#[derive(Debug, Clone, Copy)]
struct Reading {
    cpu: f64,
    memory: f64,
    disk_read: f64,
    disk_write: f64,
}

impl Reading {
    fn values(&self) -> [(MetricKind, f64); 4] {
        [
            (MetricKind::Cpu, self.cpu),
            (MetricKind::Memory, self.memory),
            (MetricKind::DiskRead, self.disk_read),
            (MetricKind::DiskWrite, self.disk_write),
        ]
    }
}

/// Samples every instance of a process name into a series store
pub struct ProcessSampler<'a> {
    probe: &'a dyn ProcessProbe,
    ports: &'a dyn PortUsage,
    budget: usize,
    delay: Duration,
}

impl<'a> ProcessSampler<'a> {
    pub fn new(
        probe: &'a dyn ProcessProbe,
        ports: &'a dyn PortUsage,
        budget: usize,
        delay: Duration,
    ) -> Self {
        Self {
            probe,
            ports,
            budget,
            delay,
        }
    }

    /// Sample all instances of `name`
    ///
    /// Port usage of each instance is added to `port_totals` before it is sampled.
    /// Instances the agent may not inspect are skipped. Any other probe failure
    /// aborts with `ObserverError::Fatal`.
    pub async fn sample_process(
        &self,
        name: &str,
        store: &mut SeriesStore,
        port_totals: &mut PortCounts,
        cancel: &CancellationToken,
    ) -> Result<Vec<SampleOutcome>, ObserverError> {
        let pids = self.probe.instances(name);
        if pids.is_empty() {
            debug!("No running instances of {}", name);
        }

        let mut outcomes = Vec::with_capacity(pids.len());
        for pid in pids {
            if cancel.is_cancelled() {
                return Err(ObserverError::Cancelled);
            }

            let outcome = self
                .sample_instance(name, pid, store, port_totals, cancel)
                .await?;
            match &outcome {
                SampleOutcome::Sampled(count) => {
                    debug!("Recorded {} sample(s) for {} (pid {})", count, name, pid);
                }
                SampleOutcome::Skipped(SkipReason::PrivilegeDenied(e)) => {
                    info!(
                        "Can't observe {} (pid {}) due to its privilege level: {}",
                        name, pid, e
                    );
                }
                SampleOutcome::Skipped(SkipReason::Exited) => {
                    debug!("{} (pid {}) exited before sampling", name, pid);
                }
                SampleOutcome::Failed(e) => {
                    warn!("Unhandled failure sampling {} (pid {}): {}", name, pid, e);
                    return Err(ObserverError::Fatal(format!(
                        "sampling {} (pid {}): {}",
                        name, pid, e
                    )));
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Sample one instance
    ///
    /// Samples are held back until the instance finishes so a privilege denial
    /// partway through leaves nothing behind. `Err` is only returned for
    /// cancellation or series failures.
    async fn sample_instance(
        &self,
        name: &str,
        pid: u32,
        store: &mut SeriesStore,
        port_totals: &mut PortCounts,
        cancel: &CancellationToken,
    ) -> Result<SampleOutcome, ObserverError> {
        match self.ports.port_counts(pid) {
            Ok(counts) => *port_totals += counts,
            Err(ProbeError::PermissionDenied(e)) => {
                return Ok(SampleOutcome::Skipped(SkipReason::PrivilegeDenied(e)))
            }
            Err(ProbeError::Exited(_)) => return Ok(SampleOutcome::Skipped(SkipReason::Exited)),
            Err(e) => return Ok(SampleOutcome::Failed(e)),
        }

        let mut readings = Vec::with_capacity(self.budget);
        for iteration in 0..self.budget {
            if cancel.is_cancelled() {
                return Err(ObserverError::Cancelled);
            }
            if self.probe.has_exited(pid) {
                break;
            }

            match self.read(pid) {
                Ok(reading) => readings.push(reading),
                Err(ProbeError::Exited(_)) => break,
                Err(ProbeError::PermissionDenied(e)) => {
                    return Ok(SampleOutcome::Skipped(SkipReason::PrivilegeDenied(e)))
                }
                Err(e) => return Ok(SampleOutcome::Failed(e)),
            }

            if iteration + 1 < self.budget {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ObserverError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }

        if readings.is_empty() {
            return Ok(SampleOutcome::Skipped(SkipReason::Exited));
        }
        for reading in &readings {
            for (metric, value) in reading.values() {
                store.append(name, metric, value)?;
            }
        }
        Ok(SampleOutcome::Sampled(readings.len()))
    }

    fn read(&self, pid: u32) -> Result<Reading, ProbeError> {
        Ok(Reading {
            cpu: self.probe.cpu_percent(pid)?,
            disk_read: self.probe.disk_ops_per_sec(pid, IoDirection::Read)?,
            disk_write: self.probe.disk_ops_per_sec(pid, IoDirection::Write)?,
            memory: self.probe.working_set_mb(pid)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// How a scripted instance behaves
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct Script {
        /// Exit after this many successful readings
        pub exits_after: Option<usize>,
        pub denied: bool,
        pub broken: bool,
        pub cpu: f64,
        pub memory: f64,
    }

    /// Probe whose instances follow a fixed script
    pub(crate) struct ScriptedProbe {
        processes: HashMap<String, Vec<u32>>,
        scripts: HashMap<u32, Script>,
        readings: Mutex<HashMap<u32, usize>>,
    }

    impl ScriptedProbe {
        pub(crate) fn new() -> Self {
            Self {
                processes: HashMap::new(),
                scripts: HashMap::new(),
                readings: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn with_instance(mut self, name: &str, pid: u32, script: Script) -> Self {
            self.processes.entry(name.to_string()).or_default().push(pid);
            self.scripts.insert(pid, script);
            self
        }

        fn script(&self, pid: u32) -> Result<Script, ProbeError> {
            let script = self.scripts.get(&pid).copied().ok_or(ProbeError::Exited(pid))?;
            if script.denied {
                return Err(ProbeError::PermissionDenied(format!("pid {}", pid)));
            }
            if script.broken {
                return Err(ProbeError::Other("counter corrupt".to_string()));
            }
            Ok(script)
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn instances(&self, name: &str) -> Vec<u32> {
            self.processes.get(name).cloned().unwrap_or_default()
        }

        fn has_exited(&self, pid: u32) -> bool {
            let taken = self.readings.lock().unwrap().get(&pid).copied().unwrap_or(0);
            match self.scripts.get(&pid) {
                Some(script) => script.exits_after.map_or(false, |n| taken >= n),
                None => true,
            }
        }

        fn cpu_percent(&self, pid: u32) -> Result<f64, ProbeError> {
            Ok(self.script(pid)?.cpu)
        }

        fn working_set_mb(&self, pid: u32) -> Result<f64, ProbeError> {
            let script = self.script(pid)?;
            *self.readings.lock().unwrap().entry(pid).or_insert(0) += 1;
            Ok(script.memory)
        }

        fn disk_ops_per_sec(&self, pid: u32, _direction: IoDirection) -> Result<f64, ProbeError> {
            self.script(pid)?;
            Ok(1.0)
        }
    }

    /// Fixed port counts for every pid
    pub(crate) struct FixedPorts(pub PortCounts);

    impl PortUsage for FixedPorts {
        fn port_counts(&self, _pid: u32) -> Result<PortCounts, ProbeError> {
            Ok(self.0)
        }
    }

    fn ports() -> FixedPorts {
        FixedPorts(PortCounts {
            active: 3,
            ephemeral: 1,
        })
    }

    fn steady() -> Script {
        Script {
            cpu: 10.0,
            memory: 200.0,
            ..Script::default()
        }
    }

    #[tokio::test]
    async fn test_instance_exiting_midway_keeps_samples_taken() {
        let probe = ScriptedProbe::new().with_instance(
            "gatewayd",
            100,
            Script {
                exits_after: Some(2),
                ..steady()
            },
        );
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 4, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();

        let outcomes = sampler
            .sample_process("gatewayd", &mut store, &mut totals, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes, vec![SampleOutcome::Sampled(2)]);
        for metric in MetricKind::ALL {
            assert_eq!(store.get("gatewayd", metric).unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_privilege_denied_instance_is_skipped() {
        let probe = ScriptedProbe::new()
            .with_instance("fabricdca", 1, steady())
            .with_instance(
                "fabricdca",
                2,
                Script {
                    denied: true,
                    ..steady()
                },
            )
            .with_instance("fabricdca", 3, steady());
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 3, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();

        let outcomes = sampler
            .sample_process("fabricdca", &mut store, &mut totals, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(
            outcomes[1],
            SampleOutcome::Skipped(SkipReason::PrivilegeDenied(_))
        ));
        assert_eq!(store.get("fabricdca", MetricKind::Cpu).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_unexpected_probe_failure_is_fatal() {
        let probe = ScriptedProbe::new().with_instance(
            "fabricgateway",
            7,
            Script {
                broken: true,
                ..steady()
            },
        );
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 3, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();

        let result = sampler
            .sample_process("fabricgateway", &mut store, &mut totals, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ObserverError::Fatal(_))));
        assert_eq!(store.total_samples(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_sampling() {
        let probe = ScriptedProbe::new().with_instance("gatewayd", 1, steady());
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 3, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = sampler
            .sample_process("gatewayd", &mut store, &mut totals, &cancel)
            .await;

        assert!(matches!(result, Err(ObserverError::Cancelled)));
        assert_eq!(store.total_samples(), 0);
    }

    #[tokio::test]
    async fn test_port_counts_accumulate_per_instance() {
        let probe = ScriptedProbe::new()
            .with_instance("fabricdns", 1, steady())
            .with_instance("fabricdns", 2, steady());
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 1, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();

        sampler
            .sample_process("fabricdns", &mut store, &mut totals, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            totals,
            PortCounts {
                active: 6,
                ephemeral: 2
            }
        );
    }

    #[tokio::test]
    async fn test_missing_process_yields_no_outcomes() {
        let probe = ScriptedProbe::new();
        let ports = ports();
        let sampler = ProcessSampler::new(&probe, &ports, 3, Duration::ZERO);
        let mut store = SeriesStore::new(100);
        let mut totals = PortCounts::default();

        let outcomes = sampler
            .sample_process("absent", &mut store, &mut totals, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert!(store.is_empty());
    }
}
