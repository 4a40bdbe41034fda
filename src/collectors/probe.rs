use crate::error::ProbeError;
use log::debug;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Value returned by a counter the host cannot provide
///
/// Negative averages are treated as "not collected" and skipped by the evaluator.
pub const NOT_COLLECTED: f64 = -1.0;

/// Direction of per-process disk I/O operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

/// Process discovery and per-process perf counters
///
/// Instances are addressed by pid once discovered by name.
pub trait ProcessProbe: Send + Sync {
    /// Pids of live processes whose name is exactly `name`
    fn instances(&self, name: &str) -> Vec<u32>;

    fn has_exited(&self, pid: u32) -> bool;

    /// Processor time as a percentage of total host capacity
    fn cpu_percent(&self, pid: u32) -> Result<f64, ProbeError>;

    /// Resident working set in megabytes
    fn working_set_mb(&self, pid: u32) -> Result<f64, ProbeError>;

    /// Disk I/O operations per second
    fn disk_ops_per_sec(&self, pid: u32, direction: IoDirection) -> Result<f64, ProbeError>;
}

/// Cumulative I/O operation counters from `/proc/<pid>/io`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub read_ops: u64,
    pub write_ops: u64,
}

impl IoCounters {
    /// Parse the `syscr`/`syscw` fields of a `/proc/<pid>/io` file
    pub fn parse(content: &str) -> Option<Self> {
        let mut read_ops = None;
        let mut write_ops = None;
        for line in content.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().map(str::trim);
            let value = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
            match key {
                Some("syscr") => read_ops = value,
                Some("syscw") => write_ops = value,
                _ => {}
            }
        }
        Some(Self {
            read_ops: read_ops?,
            write_ops: write_ops?,
        })
    }

    fn get(&self, direction: IoDirection) -> u64 {
        match direction {
            IoDirection::Read => self.read_ops,
            IoDirection::Write => self.write_ops,
        }
    }
}

/// Counter snapshot used to turn cumulative counts into rates
#[derive(Debug, Clone, Copy)]
struct IoSnapshot {
    counters: IoCounters,
    taken_at: Instant,
    /// Process start time; a recycled pid starts later and gets a fresh baseline
    started: u64,
}

/// Probe backed by `sysinfo`, with disk operation counts read from procfs
///
/// CPU usage is normalised by the number of processing units so 100% means the
/// whole host. The first CPU reading of a process is 0 because `sysinfo` needs two
/// refreshes to compute a delta.
pub struct SysinfoProbe {
    system: Mutex<System>,
    io_snapshots: Mutex<HashMap<(u32, IoDirection), IoSnapshot>>,
    proc_root: PathBuf,
    cpu_count: f64,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self {
            system: Mutex::new(System::new()),
            io_snapshots: Mutex::new(HashMap::new()),
            proc_root: PathBuf::from("/proc"),
            cpu_count,
        }
    }

    fn lock_system(&self) -> Result<std::sync::MutexGuard<'_, System>, ProbeError> {
        self.system
            .lock()
            .map_err(|_| ProbeError::Other("process table lock poisoned".to_string()))
    }

    /// Refresh one process and read a value from it
    fn with_process<T>(
        &self,
        pid: u32,
        kind: ProcessRefreshKind,
        read: impl FnOnce(&sysinfo::Process) -> T,
    ) -> Result<T, ProbeError> {
        let mut system = self.lock_system()?;
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[sys_pid]), true, kind);
        system
            .process(sys_pid)
            .map(read)
            .ok_or(ProbeError::Exited(pid))
    }

    fn lock_snapshots(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(u32, IoDirection), IoSnapshot>>, ProbeError>
    {
        self.io_snapshots
            .lock()
            .map_err(|_| ProbeError::Other("I/O snapshot lock poisoned".to_string()))
    }

    /// Drop the I/O baselines of `pid`
    fn forget(&self, pid: u32) {
        if let Ok(mut snapshots) = self.lock_snapshots() {
            snapshots.retain(|(tracked, _), _| *tracked != pid);
        }
    }

    #[cfg(test)]
    fn tracked_pids(&self) -> Vec<u32> {
        let snapshots = self.io_snapshots.lock().unwrap();
        let mut pids: Vec<u32> = snapshots.keys().map(|(pid, _)| *pid).collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn read_io_counters(&self, pid: u32) -> Result<Option<IoCounters>, ProbeError> {
        let path = self.proc_root.join(pid.to_string()).join("io");
        if !self.proc_root.exists() {
            return Ok(None);
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(IoCounters::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProbeError::Exited(pid)),
            Err(e) => Err(ProbeError::from(e)),
        }
    }
}

impl ProcessProbe for SysinfoProbe {
    fn instances(&self, name: &str) -> Vec<u32> {
        let mut system = match self.lock_system() {
            Ok(system) => system,
            Err(_) => return Vec::new(),
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        let mut pids: Vec<u32> = system
            .processes_by_exact_name(OsStr::new(name))
            .map(|p| p.pid().as_u32())
            .collect();
        pids.sort_unstable();

        if let Ok(mut snapshots) = self.lock_snapshots() {
            snapshots.retain(|(pid, _), _| system.process(Pid::from_u32(*pid)).is_some());
        }
        debug!("Resolved {} instance(s) of {}", pids.len(), name);
        pids
    }

    fn has_exited(&self, pid: u32) -> bool {
        self.with_process(pid, ProcessRefreshKind::nothing(), |_| ())
            .is_err()
    }

    fn cpu_percent(&self, pid: u32) -> Result<f64, ProbeError> {
        let raw = self.with_process(pid, ProcessRefreshKind::nothing().with_cpu(), |p| {
            p.cpu_usage() as f64
        })?;
        Ok(raw / self.cpu_count)
    }

    fn working_set_mb(&self, pid: u32) -> Result<f64, ProbeError> {
        self.with_process(pid, ProcessRefreshKind::nothing().with_memory(), |p| {
            p.memory() as f64 / 1024.0 / 1024.0
        })
    }

    fn disk_ops_per_sec(&self, pid: u32, direction: IoDirection) -> Result<f64, ProbeError> {
        let result = self.disk_ops_rate(pid, direction);
        if let Err(ProbeError::Exited(_)) = result {
            self.forget(pid);
        }
        result
    }
}

impl SysinfoProbe {
    fn disk_ops_rate(&self, pid: u32, direction: IoDirection) -> Result<f64, ProbeError> {
        let counters = match self.read_io_counters(pid)? {
            Some(counters) => counters,
            None => return Ok(NOT_COLLECTED),
        };
        let (started, run_time) = self.with_process(pid, ProcessRefreshKind::nothing(), |p| {
            (p.start_time(), p.run_time())
        })?;
        let now = Instant::now();

        let previous = self.lock_snapshots()?.insert(
            (pid, direction),
            IoSnapshot {
                counters,
                taken_at: now,
                started,
            },
        );

        match previous.filter(|prev| prev.started == started) {
            Some(prev) => {
                let elapsed = now.duration_since(prev.taken_at).as_secs_f64();
                if elapsed <= 0.0 {
                    return Ok(0.0);
                }
                let delta = counters
                    .get(direction)
                    .saturating_sub(prev.counters.get(direction));
                Ok(delta as f64 / elapsed)
            }
            None => {
                // No baseline yet: average rate over the process lifetime
                if run_time == 0 {
                    return Ok(0.0);
                }
                Ok(counters.get(direction) as f64 / run_time as f64)
            }
        }
    }
}
