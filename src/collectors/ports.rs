use crate::error::ProbeError;
use log::debug;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Default dynamic port range when the kernel setting is unreadable
const DEFAULT_EPHEMERAL_RANGE: RangeInclusive<u16> = 32768..=60999;

/// TCP port usage of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounts {
    /// All TCP sockets owned by the process
    pub active: usize,
    /// Sockets bound to a local port in the dynamic range
    pub ephemeral: usize,
}

impl std::ops::AddAssign for PortCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.active += rhs.active;
        self.ephemeral += rhs.ephemeral;
    }
}

/// Per-process network port usage
pub trait PortUsage: Send + Sync {
    fn port_counts(&self, pid: u32) -> Result<PortCounts, ProbeError>;
}

/// Port usage read from procfs
///
/// Socket inodes are collected from `/proc/<pid>/fd` and matched against the
/// process's `net/tcp` and `net/tcp6` tables. Hosts without procfs report zero.
pub struct ProcNetPorts {
    proc_root: PathBuf,
}

impl Default for ProcNetPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcNetPorts {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate procfs mount
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn ephemeral_range(&self) -> RangeInclusive<u16> {
        let path = self
            .proc_root
            .join("sys")
            .join("net")
            .join("ipv4")
            .join("ip_local_port_range");
        fs::read_to_string(path)
            .ok()
            .and_then(|content| parse_port_range(&content))
            .unwrap_or(DEFAULT_EPHEMERAL_RANGE)
    }

    fn socket_inodes(&self, pid_dir: &Path) -> Result<HashSet<u64>, std::io::Error> {
        let mut inodes = HashSet::new();
        for entry in fs::read_dir(pid_dir.join("fd"))? {
            let entry = entry?;
            // fds can close between listing and reading the link
            let target = match fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }
}

impl PortUsage for ProcNetPorts {
    fn port_counts(&self, pid: u32) -> Result<PortCounts, ProbeError> {
        if !self.proc_root.exists() {
            return Ok(PortCounts::default());
        }

        let pid_dir = self.proc_root.join(pid.to_string());
        let inodes = match self.socket_inodes(&pid_dir) {
            Ok(inodes) => inodes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Process {} exited before its ports were counted", pid);
                return Ok(PortCounts::default());
            }
            Err(e) => return Err(ProbeError::from(e)),
        };
        if inodes.is_empty() {
            return Ok(PortCounts::default());
        }

        let range = self.ephemeral_range();
        let mut counts = PortCounts::default();
        for table in ["tcp", "tcp6"] {
            let content = match fs::read_to_string(pid_dir.join("net").join(table)) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(ProbeError::from(e)),
            };
            for (port, inode) in parse_tcp_table(&content) {
                if inodes.contains(&inode) {
                    counts.active += 1;
                    if range.contains(&port) {
                        counts.ephemeral += 1;
                    }
                }
            }
        }
        Ok(counts)
    }
}

/// Inode of a `socket:[12345]` fd link target
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parse `ip_local_port_range`, two whitespace-separated ports
fn parse_port_range(content: &str) -> Option<RangeInclusive<u16>> {
    let mut parts = content.split_whitespace();
    let low = parts.next()?.parse().ok()?;
    let high = parts.next()?.parse().ok()?;
    Some(low..=high)
}

/// `(local port, inode)` of every row in a `/proc/net/tcp` style table
fn parse_tcp_table(content: &str) -> Vec<(u16, u64)> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let port_hex = local.rsplit(':').next()?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields.get(9)?.parse().ok()?;
            Some((port, inode))
        })
        .collect()
}
