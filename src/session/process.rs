// ABOUTME: Host OS process capability: detached spawn, liveness by PID, signals and /proc resource snapshots
// Liveness never mutates session records; reconciliation belongs to the session manager

use super::SessionError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
    Stop,
    Continue,
}

impl ProcessSignal {
    fn as_nix(self) -> Signal {
        match self {
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
            ProcessSignal::Stop => Signal::SIGSTOP,
            ProcessSignal::Continue => Signal::SIGCONT,
        }
    }
}

/// What to launch for a detached session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub log_file: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub pid: i32,
    pub rss_kb: u64,
    pub cpu_seconds: f64,
    pub threads: u32,
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessHost: Send + Sync {
    /// Start the process without waiting on it and return its PID.
    fn spawn_detached(&self, spec: &SpawnSpec) -> Result<i32, SessionError>;

    fn is_running(&self, pid: i32) -> bool;

    fn signal(&self, pid: i32, signal: ProcessSignal) -> Result<(), SessionError>;

    fn resource_usage(&self, pid: i32) -> Option<ResourceUsage>;
}

#[derive(Debug, Default, Clone)]
pub struct OsProcessHost;

impl OsProcessHost {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessHost for OsProcessHost {
    fn spawn_detached(&self, spec: &SpawnSpec) -> Result<i32, SessionError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SessionError::Spawn("command is empty".to_string()))?;

        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)?;
        let stderr = stdout.try_clone()?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{}: {}", program, e)))?;

        let pid = child.id() as i32;
        info!("Spawned detached process {} ({})", pid, program);

        // Reap the child so an exited process does not linger as a zombie
        // that still answers signal 0.
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!("Process {} exited with {}", pid, status),
            Err(e) => warn!("Failed to wait on process {}: {}", pid, e),
        });

        Ok(pid)
    }

    fn is_running(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(_) => !is_zombie(pid),
            Err(Errno::ESRCH) => false,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal(&self, pid: i32, signal: ProcessSignal) -> Result<(), SessionError> {
        if pid <= 0 {
            return Err(SessionError::Signal {
                pid,
                message: "invalid pid".to_string(),
            });
        }
        debug!("Sending {:?} to process {}", signal, pid);
        kill(Pid::from_raw(pid), signal.as_nix()).map_err(|e| SessionError::Signal {
            pid,
            message: e.to_string(),
        })
    }

    fn resource_usage(&self, pid: i32) -> Option<ResourceUsage> {
        if !self.is_running(pid) {
            return None;
        }
        read_proc_usage(Path::new("/proc"), pid)
    }
}

/// A process that exited but has not been reaped by a foreign parent still
/// accepts signal 0.
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat_fields(&stat).map(|fields| fields[0] == "Z"))
        .unwrap_or(false)
}

/// Fields after the `(comm)` entry of /proc/<pid>/stat, starting at state.
fn parse_stat_fields(stat: &str) -> Option<Vec<&str>> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

const CLOCK_TICKS_PER_SEC: f64 = 100.0;

fn read_proc_usage(proc_root: &Path, pid: i32) -> Option<ResourceUsage> {
    let dir = proc_root.join(pid.to_string());
    let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
    let status = std::fs::read_to_string(dir.join("status")).ok()?;

    // utime and stime are fields 14 and 15 of stat, i.e. 11 and 12 after state.
    let fields = parse_stat_fields(&stat)?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    let mut rss_kb = 0;
    let mut threads = 0;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            rss_kb = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("Threads:") {
            threads = value.trim().parse().unwrap_or(0);
        }
    }

    Some(ResourceUsage {
        pid,
        rss_kb,
        cpu_seconds: (utime + stime) as f64 / CLOCK_TICKS_PER_SEC,
        threads,
    })
}
