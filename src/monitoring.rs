//! Self-monitoring for the agent
//!
//! Tracks how observation cycles end and how long they take, along with the
//! agent's own memory footprint.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Stopwatch for one observation cycle
#[derive(Debug, Default)]
pub struct CycleTimer {
    started: Option<Instant>,
    elapsed: Duration,
}

impl CycleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from zero
    pub fn start(&mut self) {
        self.elapsed = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    /// Stop and return the elapsed time
    pub fn stop(&mut self) -> Duration {
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
        self.elapsed
    }

    pub fn reset(&mut self) {
        self.started = None;
        self.elapsed = Duration::ZERO;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => started.elapsed(),
            None => self.elapsed,
        }
    }
}

/// How an observation cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Completed,
    /// Stopped by the cluster gate
    Abandoned,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
struct CycleRecord {
    result: CycleResult,
    duration: Duration,
    #[allow(dead_code)]
    finished_at: DateTime<Utc>,
}

/// Snapshot of agent statistics
#[derive(Debug, Clone)]
pub struct AgentStatsSnapshot {
    /// Resident memory of the agent in bytes, 0 when unknown
    pub memory_usage_bytes: u64,
    pub completed: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// Mean duration of completed cycles
    pub avg_cycle_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl AgentStatsSnapshot {
    pub fn total(&self) -> usize {
        self.completed + self.abandoned + self.cancelled + self.failed
    }
}

/// Bounded history of cycle outcomes
#[derive(Debug)]
pub struct AgentStats {
    history: Mutex<VecDeque<CycleRecord>>,
    max_history: usize,
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new(100)
    }
}

impl AgentStats {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    pub fn record_cycle(&self, result: CycleResult, duration: Duration) {
        debug!("Recording cycle result {:?} after {:?}", result, duration);

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(CycleRecord {
            result,
            duration,
            finished_at: Utc::now(),
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let count = |result: CycleResult| history.iter().filter(|r| r.result == result).count();

        let completed: Vec<&CycleRecord> = history
            .iter()
            .filter(|r| r.result == CycleResult::Completed)
            .collect();
        let avg_cycle_ms = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .map(|r| r.duration.as_millis() as f64)
                .sum::<f64>()
                / completed.len() as f64
        };

        AgentStatsSnapshot {
            memory_usage_bytes: memory_usage_bytes(),
            completed: completed.len(),
            abandoned: count(CycleResult::Abandoned),
            cancelled: count(CycleResult::Cancelled),
            failed: count(CycleResult::Failed),
            avg_cycle_ms,
            timestamp: Utc::now(),
        }
    }

    /// Log a one-line summary of recent cycles
    pub fn log_summary(&self) -> AgentStatsSnapshot {
        let snapshot = self.snapshot();
        info!(
            "Agent stats: memory={}MB, cycles={} (completed={}, abandoned={}, cancelled={}, failed={}), avg_cycle={:.1}ms",
            snapshot.memory_usage_bytes / 1024 / 1024,
            snapshot.total(),
            snapshot.completed,
            snapshot.abandoned,
            snapshot.cancelled,
            snapshot.failed,
            snapshot.avg_cycle_ms
        );

        if snapshot.failed > 0 && snapshot.failed * 2 >= snapshot.total() {
            warn!(
                "{} of the last {} cycles failed",
                snapshot.failed,
                snapshot.total()
            );
        }
        snapshot
    }
}

/// Resident memory of this process
fn memory_usage_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|kb| kb.parse::<u64>().ok())
                    {
                        return kb * 1024;
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    {
        // Peak rather than current usage, still better than nothing
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } == 0 {
            #[cfg(target_os = "macos")]
            return usage.ru_maxrss as u64;

            #[cfg(not(target_os = "macos"))]
            return (usage.ru_maxrss as u64) * 1024;
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timer_measures_elapsed() {
        let mut timer = CycleTimer::new();
        assert!(!timer.is_running());

        timer.start();
        assert!(timer.is_running());
        thread::sleep(Duration::from_millis(10));
        let elapsed = timer.stop();

        assert!(elapsed >= Duration::from_millis(10));
        assert!(!timer.is_running());
        assert_eq!(timer.elapsed(), elapsed);

        timer.reset();
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_stop_without_start_is_zero() {
        let mut timer = CycleTimer::new();
        assert_eq!(timer.stop(), Duration::ZERO);
    }

    #[test]
    fn test_stats_count_outcomes() {
        let stats = AgentStats::new(10);
        stats.record_cycle(CycleResult::Completed, Duration::from_millis(100));
        stats.record_cycle(CycleResult::Completed, Duration::from_millis(300));
        stats.record_cycle(CycleResult::Abandoned, Duration::from_millis(5));
        stats.record_cycle(CycleResult::Failed, Duration::from_millis(50));

        let snapshot = stats.log_summary();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.cancelled, 0);
        assert!((snapshot.avg_cycle_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_is_bounded() {
        let stats = AgentStats::new(5);
        for _ in 0..20 {
            stats.record_cycle(CycleResult::Completed, Duration::from_millis(1));
        }
        assert_eq!(stats.snapshot().total(), 5);
    }

    #[test]
    fn test_empty_stats() {
        let snapshot = AgentStats::default().snapshot();
        assert_eq!(snapshot.total(), 0);
        assert_eq!(snapshot.avg_cycle_ms, 0.0);
    }
}
