//! Observation cycle controller
//!
//! One cycle walks `Initializing → ClusterGate → Sampling → Harvesting → Reporting`
//! and returns to `Idle`. Samples are staged per cycle and only become part of the
//! retained series once Reporting completes, so a cancelled or failed cycle leaves
//! the retained series exactly as it found them.

use crate::aggregator::SeriesStore;
use crate::alerts::{HealthReportSink, MetricStore};
use crate::collectors::event_log::HarvestSummary;
use crate::collectors::process_sampler::{SampleOutcome, SkipReason};
use crate::collectors::{
    ClusterHealthSource, EventLogHarvester, EventLogReader, PortCounts, PortUsage,
    ProcessProbe, ProcessSampler,
};
use crate::config::Config;
use crate::error::ObserverError;
use crate::events::{HealthReport, HealthState, MetricKind};
use crate::monitoring::CycleTimer;
use crate::triggers::{ClusterGate, ThresholdEvaluator, ThresholdPolicy, TtlPolicy, Verdict};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Property name of the port-usage report
pub const PORTS_PROPERTY: &str = "Ports";

/// Phase of the observation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Initializing,
    ClusterGate,
    Sampling,
    Harvesting,
    Reporting,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// External services the cycle talks to
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn ProcessProbe>,
    pub ports: Arc<dyn PortUsage>,
    pub reporter: Arc<dyn HealthReportSink>,
    /// Gate is skipped without a source
    pub cluster: Option<Arc<dyn ClusterHealthSource>>,
    pub metric_store: Option<Arc<dyn MetricStore>>,
    /// Required for event-log harvesting
    pub event_log: Option<Arc<dyn EventLogReader>>,
}

/// What a completed cycle did
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub runtime: Duration,
    pub ttl: Duration,
    pub verdicts: Vec<Verdict>,
    pub port_usage: PortCounts,
    pub sampled_instances: usize,
    pub skipped_instances: usize,
    pub events: Option<HarvestSummary>,
    /// Whether the retained series were released in cleanup
    pub series_released: bool,
}

impl CycleSummary {
    /// Verdicts in Warning or Error
    pub fn alarms(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.state.is_alarm())
    }
}

/// How a cycle ended without error
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// The cluster gate returned Error; nothing was sampled or reported
    Abandoned,
}

/// Cycle settings derived from configuration
#[derive(Debug, Clone)]
struct Settings {
    roster: Vec<String>,
    node_name: String,
    observer_name: String,
    series_file: String,
    budget: usize,
    delay: Duration,
    series_capacity: usize,
    policies: Vec<ThresholdPolicy>,
    gate: ClusterGate,
    ttl: TtlPolicy,
}

impl Settings {
    fn from_config(config: &Config) -> Self {
        Self {
            roster: config.agent.processes.clone(),
            node_name: config.agent.node_name.clone(),
            observer_name: config.agent.observer_name.clone(),
            series_file: format!("SystemServices_{}", config.agent.node_name),
            budget: config.sampling.sample_budget(),
            delay: config.sampling.delay(),
            series_capacity: config.sampling.series_capacity,
            policies: ThresholdPolicy::from_config(&config.thresholds),
            gate: ClusterGate::from_config(&config.thresholds, &config.cluster),
            ttl: TtlPolicy::new(
                config.reporting.ttl_multiplier,
                Duration::from_secs(config.reporting.ttl_padding_seconds),
            ),
        }
    }
}

/// Runs observation cycles and owns all state carried between them
pub struct ObservationCycle {
    settings: Settings,
    collaborators: Collaborators,
    series: SeriesStore,
    harvester: Option<EventLogHarvester>,
    ports: PortCounts,
    alarm_outstanding: bool,
    last_runtime: Duration,
    phase: CyclePhase,
    timer: CycleTimer,
}

impl ObservationCycle {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let settings = Settings::from_config(config);
        let harvester = if config.event_log.enabled && collaborators.event_log.is_some() {
            Some(EventLogHarvester::new(
                config.event_log.sources.clone(),
                config.event_log.window(),
                config.event_log.display_threshold,
                &config.agent.log_root,
            ))
        } else {
            if config.event_log.enabled {
                warn!("Event-log monitoring enabled but no event-log reader configured");
            }
            None
        };

        Self {
            series: SeriesStore::new(settings.series_capacity),
            settings,
            collaborators,
            harvester,
            ports: PortCounts::default(),
            alarm_outstanding: false,
            last_runtime: Duration::ZERO,
            phase: CyclePhase::Idle,
            timer: CycleTimer::new(),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Series retained from previous cycles
    pub fn series(&self) -> &SeriesStore {
        &self.series
    }

    /// Whether the last completed cycle raised a Warning or Error
    pub fn alarm_outstanding(&self) -> bool {
        self.alarm_outstanding
    }

    /// Elapsed runtime of the last cycle that reached Reporting, used for TTLs
    pub fn last_runtime(&self) -> Duration {
        self.last_runtime
    }

    /// Path of the event-log summary artifact, when harvesting is enabled
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.harvester.as_ref().map(|h| h.artifact_path().to_path_buf())
    }

    /// Run one full cycle
    ///
    /// # Errors
    ///
    /// `ObserverError::Cancelled` when `cancel` fires, `ObserverError::Fatal` for
    /// unexpected collaborator failures. The controller is back in `Idle` either way
    /// and ready for the next cycle.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome, ObserverError> {
        let result = self.run_phases(cancel).await;
        if result.is_err() {
            if let Some(harvester) = self.harvester.as_mut() {
                harvester.discard();
            }
        }
        self.timer.reset();
        self.enter(CyclePhase::Idle);
        result
    }

    async fn run_phases(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome, ObserverError> {
        self.initialize(cancel)?;

        self.enter(CyclePhase::ClusterGate);
        if let Some(cluster) = self.collaborators.cluster.clone() {
            match self.settings.gate.check(cluster.as_ref()).await? {
                HealthState::Error => {
                    warn!("Too many cluster nodes in error, abandoning this cycle");
                    return Ok(CycleOutcome::Abandoned);
                }
                HealthState::Warning => warn!("Cluster health gate at warning level, continuing"),
                HealthState::Unknown => info!("Cluster health unknown, continuing"),
                HealthState::Ok => {}
            }
        }

        self.enter(CyclePhase::Sampling);
        let mut staged = SeriesStore::new(self.settings.series_capacity);
        let (sampled_instances, skipped_instances) = self.sample_roster(&mut staged, cancel).await?;

        if self.harvester.is_some() {
            self.enter(CyclePhase::Harvesting);
            self.check_cancelled(cancel)?;
            if let (Some(harvester), Some(reader)) =
                (self.harvester.as_mut(), self.collaborators.event_log.as_ref())
            {
                harvester.harvest(reader.as_ref(), cancel)?;
            }
        }

        self.enter(CyclePhase::Reporting);
        let summary = self
            .report(staged, sampled_instances, skipped_instances, cancel)
            .await?;
        Ok(CycleOutcome::Completed(summary))
    }

    fn initialize(&mut self, cancel: &CancellationToken) -> Result<(), ObserverError> {
        self.check_cancelled(cancel)?;
        self.enter(CyclePhase::Initializing);

        for name in &self.settings.roster {
            for metric in MetricKind::ALL {
                self.series.ensure(name, metric);
            }
        }
        self.ports = PortCounts::default();
        self.timer.start();

        self.check_cancelled(cancel)
    }

    async fn sample_roster(
        &mut self,
        staged: &mut SeriesStore,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), ObserverError> {
        let sampler = ProcessSampler::new(
            self.collaborators.probe.as_ref(),
            self.collaborators.ports.as_ref(),
            self.settings.budget,
            self.settings.delay,
        );

        let mut sampled = 0;
        let mut skipped = 0;
        for name in &self.settings.roster {
            self.check_cancelled(cancel)?;
            let outcomes = match sampler
                .sample_process(name, staged, &mut self.ports, cancel)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(ObserverError::Cancelled) => return Err(ObserverError::Cancelled),
                Err(e) => {
                    error!("Sampling aborted while observing {}: {}", name, e);
                    return Err(e);
                }
            };
            for outcome in outcomes {
                match outcome {
                    SampleOutcome::Sampled(_) => sampled += 1,
                    SampleOutcome::Skipped(SkipReason::PrivilegeDenied(_)) => skipped += 1,
                    SampleOutcome::Skipped(SkipReason::Exited) | SampleOutcome::Failed(_) => {}
                }
            }
        }
        Ok((sampled, skipped))
    }

    async fn report(
        &mut self,
        staged: SeriesStore,
        sampled_instances: usize,
        skipped_instances: usize,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, ObserverError> {
        self.check_cancelled(cancel)?;

        let runtime = self.timer.stop();
        self.last_runtime = runtime;
        let ttl = self.settings.ttl.ttl_for(runtime);

        // Committed to `self.series` only once every report has gone out
        let mut retained = self.series.clone();
        retained.merge_from(&staged)?;

        let port_usage = self.ports;
        self.collaborators
            .reporter
            .report(&self.port_report(port_usage, ttl));
        self.ports = PortCounts::default();

        let evaluator = ThresholdEvaluator::new(
            self.collaborators.metric_store.as_deref(),
            self.settings.series_file.as_str(),
        );
        let mut verdicts = Vec::new();
        for policy in &self.settings.policies {
            if !policy.is_enabled() {
                debug!("{} thresholds disabled, skipping family", policy.metric);
                continue;
            }
            for series in retained.family(policy.metric) {
                self.check_cancelled(cancel)?;
                if let Some(verdict) = evaluator.evaluate(series, policy, ttl) {
                    self.collaborators.reporter.report(&verdict.to_report(
                        &self.settings.observer_name,
                        &self.settings.node_name,
                        policy,
                    ));
                    verdicts.push(verdict);
                }
            }
        }

        let events = match self.harvester.as_mut() {
            Some(harvester) => Some(harvester.flush(cancel)?),
            None => None,
        };

        let alarm = verdicts.iter().any(|v| v.state.is_alarm());
        self.series = retained;
        self.alarm_outstanding = alarm;
        let series_released = if alarm {
            info!(
                "Retaining {} sample(s) for trend context: alarm outstanding",
                self.series.total_samples()
            );
            false
        } else {
            self.series.release_all(self.alarm_outstanding)?;
            true
        };

        debug!(
            "Cycle finished in {:?}: {} verdict(s), ttl {}s",
            runtime,
            verdicts.len(),
            ttl.as_secs()
        );
        Ok(CycleSummary {
            runtime,
            ttl,
            verdicts,
            port_usage,
            sampled_instances,
            skipped_instances,
            events,
            series_released,
        })
    }

    fn port_report(&self, usage: PortCounts, ttl: Duration) -> HealthReport {
        HealthReport {
            source: self.settings.observer_name.clone(),
            node_name: self.settings.node_name.clone(),
            property: PORTS_PROPERTY.to_string(),
            message: format!(
                "Watched processes hold {} active TCP port(s), {} ephemeral",
                usage.active, usage.ephemeral
            ),
            state: HealthState::Ok,
            ttl,
            timestamp: Utc::now(),
        }
    }

    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), ObserverError> {
        if cancel.is_cancelled() {
            debug!("Cancellation observed in {}", self.phase);
            return Err(ObserverError::Cancelled);
        }
        Ok(())
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("Cycle phase {} -> {}", self.phase, phase);
        self.phase = phase;
    }
}
