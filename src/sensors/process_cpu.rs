//! CPU time of the target process from /proc/<pid>/stat
//!
//! Besides the user and system tick counters, the stat record carries the
//! process start time (in ticks since boot). It is constant for the life of
//! one process, so a change between two reads means the PID now belongs to
//! a different process and the running delta must be thrown away.

use crate::core::constants::paths;
use crate::error::{PidwattError, Result};
use log::{debug, info};
use procfs::process::Stat;
use procfs::FromRead;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// CPU-seconds consumed by the target during one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessCpuSample {
    pub pid: u32,
    pub app_cpu_seconds: f64,
    /// The start marker changed: this is a new process behind the same PID
    pub restarted: bool,
    pub ticks_now: u64,
    pub ticks_delta: u64,
}

#[derive(Debug)]
struct ProcessCpuState {
    pid: u32,
    last_app_ticks: Option<u64>,
    last_start_time: Option<u64>,
    primed: bool,
}

impl ProcessCpuState {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            last_app_ticks: None,
            last_start_time: None,
            primed: false,
        }
    }
}

/// Per-process CPU time reader with restart detection
#[derive(Debug)]
pub struct ProcessCpuTimeReader {
    proc_root: PathBuf,
    tick_hz: u64,
    state: ProcessCpuState,
}

impl ProcessCpuTimeReader {
    pub fn new(pid: u32, tick_hz: u64) -> Self {
        Self::with_proc_root(paths::PROC_ROOT, pid, tick_hz)
    }

    /// Read `<proc_root>/<pid>/stat` instead of the live /proc
    pub fn with_proc_root(proc_root: impl AsRef<Path>, pid: u32, tick_hz: u64) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            tick_hz: tick_hz.max(1),
            state: ProcessCpuState::new(pid),
        }
    }

    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    fn stat_path(&self) -> PathBuf {
        self.proc_root
            .join(self.state.pid.to_string())
            .join("stat")
    }

    /// Point the reader at another PID. The next sample primes again.
    pub fn retarget(&mut self, pid: u32) {
        info!("process.retarget {} -> {}", self.state.pid, pid);
        self.state = ProcessCpuState::new(pid);
    }

    async fn read_stat(&self) -> Result<Stat> {
        let path = self.stat_path();
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| PidwattError::ProcessUnavailable {
                pid: self.state.pid,
                source,
            })?;
        Stat::from_read(raw.as_slice())
            .map_err(|e| PidwattError::parse(path.display().to_string(), e.to_string()))
    }

    /// Read the process counters and return the CPU time since the last call.
    ///
    /// A process that cannot be read yields an error and leaves the baseline
    /// untouched; the caller treats that as "no data this tick".
    pub async fn sample(&mut self) -> Result<ProcessCpuSample> {
        let stat = self.read_stat().await?;
        let app_ticks_now = stat.utime.saturating_add(stat.stime);
        let pid = self.state.pid;
        let state = &mut self.state;

        if !state.primed {
            state.last_app_ticks = Some(app_ticks_now);
            state.last_start_time = Some(stat.starttime);
            state.primed = true;
            return Ok(ProcessCpuSample {
                pid,
                app_cpu_seconds: 0.0,
                restarted: false,
                ticks_now: app_ticks_now,
                ticks_delta: 0,
            });
        }

        if state.last_start_time != Some(stat.starttime) {
            debug!(
                "process.restarted pid={} starttime {:?} -> {}",
                pid, state.last_start_time, stat.starttime
            );
            state.last_app_ticks = Some(app_ticks_now);
            state.last_start_time = Some(stat.starttime);
            return Ok(ProcessCpuSample {
                pid,
                app_cpu_seconds: 0.0,
                restarted: true,
                ticks_now: app_ticks_now,
                ticks_delta: 0,
            });
        }

        let delta = app_ticks_now.saturating_sub(state.last_app_ticks.unwrap_or(app_ticks_now));
        state.last_app_ticks = Some(app_ticks_now);

        Ok(ProcessCpuSample {
            pid,
            app_cpu_seconds: delta as f64 / self.tick_hz as f64,
            restarted: false,
            ticks_now: app_ticks_now,
            ticks_delta: delta,
        })
    }
}
