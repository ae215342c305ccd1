//! Host-wide CPU time from the aggregate `cpu` line of /proc/stat

use crate::core::constants::paths;
use crate::core::interval::IntervalClamp;
use crate::error::{PidwattError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Aggregate per-category tick counters, in kernel scheduling ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// Parse the aggregate `cpu ` line out of /proc/stat content.
    ///
    /// Kernels older than 2.6.33 omit the trailing columns, which then read
    /// as zero. A present but non-numeric column is a parse error.
    pub fn parse(content: &str) -> Result<Self> {
        let line = content
            .lines()
            .find(|line| line.starts_with("cpu "))
            .ok_or_else(|| PidwattError::parse("/proc/stat", "no aggregate cpu line"))?;

        let values = line
            .split_whitespace()
            .skip(1)
            .map(|field| {
                field.parse::<u64>().map_err(|e| {
                    PidwattError::parse("/proc/stat", format!("bad field {:?}: {}", field, e))
                })
            })
            .collect::<Result<Vec<u64>>>()?;

        if values.len() < 4 {
            return Err(PidwattError::parse(
                "/proc/stat",
                format!("cpu line has {} fields, expected at least 4", values.len()),
            ));
        }

        let field = |idx: usize| values.get(idx).copied().unwrap_or(0);
        Ok(Self {
            user: field(0),
            nice: field(1),
            system: field(2),
            idle: field(3),
            iowait: field(4),
            irq: field(5),
            softirq: field(6),
            steal: field(7),
            guest: field(8),
            guest_nice: field(9),
        })
    }

    /// Ticks spent doing work. Guest time is already part of user/nice.
    pub fn active(&self) -> u64 {
        self.user
            .saturating_add(self.nice)
            .saturating_add(self.system)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
            .saturating_add(self.steal)
    }

    pub fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }
}

/// Host CPU-seconds spent active and idle during one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostCpuSample {
    pub interval_seconds: f64,
    pub host_active_seconds: f64,
    pub host_idle_seconds: f64,
    pub delta_active_ticks: u64,
    pub delta_idle_ticks: u64,
}

#[derive(Debug, Default)]
struct HostCpuState {
    last_instant: Option<Instant>,
    last_active_ticks: Option<u64>,
    last_idle_ticks: Option<u64>,
}

/// Turns successive /proc/stat readings into interval CPU-seconds
#[derive(Debug)]
pub struct HostCpuTimeReader {
    stat_path: PathBuf,
    tick_hz: u64,
    clamp: IntervalClamp,
    state: HostCpuState,
}

impl HostCpuTimeReader {
    pub fn new(tick_hz: u64, clamp: IntervalClamp) -> Self {
        Self::with_stat_path(paths::PROC_STAT, tick_hz, clamp)
    }

    /// Read from an alternative stat file (containers, fixtures)
    pub fn with_stat_path(stat_path: impl AsRef<Path>, tick_hz: u64, clamp: IntervalClamp) -> Self {
        Self {
            stat_path: stat_path.as_ref().to_path_buf(),
            tick_hz: tick_hz.max(1),
            clamp,
            state: HostCpuState::default(),
        }
    }

    pub fn tick_hz(&self) -> u64 {
        self.tick_hz
    }

    /// Read the counters and return the delta since the previous call.
    ///
    /// The first call stores the baseline and reports zero.
    pub async fn sample(&mut self, now: Instant) -> Result<HostCpuSample> {
        let content = tokio::fs::read_to_string(&self.stat_path).await?;
        let times = CpuTimes::parse(&content)?;
        let active_now = times.active();
        let idle_now = times.idle_total();

        let previous = (
            self.state.last_instant.replace(now),
            self.state.last_active_ticks.replace(active_now),
            self.state.last_idle_ticks.replace(idle_now),
        );

        let (Some(last_instant), Some(last_active), Some(last_idle)) = previous else {
            return Ok(HostCpuSample {
                interval_seconds: self.clamp.clamp(0.0),
                host_active_seconds: 0.0,
                host_idle_seconds: 0.0,
                delta_active_ticks: 0,
                delta_idle_ticks: 0,
            });
        };

        // Counters only go backwards on a reset; floor at zero
        let delta_active = active_now.saturating_sub(last_active);
        let delta_idle = idle_now.saturating_sub(last_idle);
        let hz = self.tick_hz as f64;

        Ok(HostCpuSample {
            interval_seconds: self.clamp.between(last_instant, now),
            host_active_seconds: delta_active as f64 / hz,
            host_idle_seconds: delta_idle as f64 / hz,
            delta_active_ticks: delta_active,
            delta_idle_ticks: delta_idle,
        })
    }
}
