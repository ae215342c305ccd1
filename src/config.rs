//! Agent configuration
//!
//! The on-disk format is JSON. Every section except `target` may be left
//! out and falls back to the defaults in [`crate::core::constants`]. The
//! file is validated once, at load, and turned into the runtime
//! [`SamplingConfig`] used by the loop.

use crate::core::constants::{http, interval, paths, sampling};
use crate::core::interval::IntervalClamp;
use crate::error::{PidwattError, Result};
use crate::resolver::ResolverOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, System};

/// Kernel scheduling tick frequency, falling back to 100 Hz
pub fn detect_tick_hz() -> u64 {
    // SAFETY: sysconf has no preconditions
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        sampling::FALLBACK_TICK_HZ
    }
}

/// Number of logical CPUs, at least one
pub fn detect_logical_cores() -> usize {
    let mut system = System::new();
    system.refresh_cpu_list(CpuRefreshKind::nothing());
    system.cpus().len().max(1)
}

/// Runtime settings of the sampling loop and its readers
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub period: Duration,
    pub clamp: IntervalClamp,
    pub tick_hz: u64,
    pub logical_cores: usize,
    /// Consecutive process read failures before re-resolving; 0 disables
    pub reresolve_after_failures: u32,
}

impl SamplingConfig {
    pub fn builder() -> SamplingConfigBuilder {
        SamplingConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(PidwattError::InvalidConfiguration(
                "sampling period must be > 0".to_string(),
            ));
        }
        if self.tick_hz == 0 {
            return Err(PidwattError::InvalidConfiguration(
                "tick_hz must be > 0".to_string(),
            ));
        }
        if self.logical_cores == 0 {
            return Err(PidwattError::InvalidConfiguration(
                "logical_cores must be > 0".to_string(),
            ));
        }
        self.clamp.validate()
    }
}

#[derive(Debug, Default)]
pub struct SamplingConfigBuilder {
    period: Option<Duration>,
    clamp: Option<IntervalClamp>,
    tick_hz: Option<u64>,
    logical_cores: Option<usize>,
    reresolve_after_failures: Option<u32>,
}

impl SamplingConfigBuilder {
    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn period_ms(self, ms: u64) -> Self {
        self.period(Duration::from_millis(ms))
    }

    pub fn interval_bounds(mut self, min_secs: f64, max_secs: f64) -> Self {
        self.clamp = Some(IntervalClamp { min_secs, max_secs });
        self
    }

    pub fn tick_hz(mut self, hz: u64) -> Self {
        self.tick_hz = Some(hz);
        self
    }

    pub fn logical_cores(mut self, cores: usize) -> Self {
        self.logical_cores = Some(cores);
        self
    }

    pub fn reresolve_after_failures(mut self, failures: u32) -> Self {
        self.reresolve_after_failures = Some(failures);
        self
    }

    /// Fill unset fields from the host and validate
    pub fn build(self) -> Result<SamplingConfig> {
        let config = SamplingConfig {
            period: self.period.unwrap_or(sampling::PERIOD),
            clamp: self.clamp.unwrap_or_default(),
            tick_hz: self.tick_hz.unwrap_or_else(detect_tick_hz),
            logical_cores: self.logical_cores.unwrap_or_else(detect_logical_cores),
            reresolve_after_failures: self
                .reresolve_after_failures
                .unwrap_or(sampling::RERESOLVE_AFTER_FAILURES),
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_period_ms() -> u64 {
    sampling::PERIOD.as_millis() as u64
}

fn default_interval_min() -> f64 {
    interval::MIN_SECS
}

fn default_interval_max() -> f64 {
    interval::MAX_SECS
}

fn default_reresolve() -> u32 {
    sampling::RERESOLVE_AFTER_FAILURES
}

/// `sampling` section of the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSection {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_interval_min")]
    pub interval_min_s: f64,
    #[serde(default = "default_interval_max")]
    pub interval_max_s: f64,
    /// Detected when absent
    #[serde(default)]
    pub tick_hz: Option<u64>,
    /// Detected when absent
    #[serde(default)]
    pub logical_cores: Option<usize>,
    #[serde(default = "default_reresolve")]
    pub reresolve_after_failures: u32,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            interval_min_s: default_interval_min(),
            interval_max_s: default_interval_max(),
            tick_hz: None,
            logical_cores: None,
            reresolve_after_failures: default_reresolve(),
        }
    }
}

impl SamplingSection {
    pub fn to_config(&self) -> Result<SamplingConfig> {
        let mut builder = SamplingConfig::builder()
            .period_ms(self.period_ms)
            .interval_bounds(self.interval_min_s, self.interval_max_s)
            .reresolve_after_failures(self.reresolve_after_failures);
        if let Some(hz) = self.tick_hz {
            builder = builder.tick_hz(hz);
        }
        if let Some(cores) = self.logical_cores {
            builder = builder.logical_cores(cores);
        }
        builder.build()
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from(paths::POWERCAP)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaplSection {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

impl Default for RaplSection {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergySection {
    #[serde(default)]
    pub rapl: RaplSection,
}

fn default_listen() -> String {
    http::LISTEN.to_string()
}

fn default_port() -> u16 {
    http::PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
        }
    }
}

impl HttpSection {
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSection {
    #[serde(default)]
    pub http: HttpSection,
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// The whole configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub energy: EnergySection,
    /// How to find the process to attribute energy to
    pub target: ResolverOptions,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl AgentConfig {
    /// Configuration with defaults everywhere except the target
    pub fn new(target: ResolverOptions) -> Self {
        Self {
            sampling: SamplingSection::default(),
            energy: EnergySection::default(),
            target,
            export: ExportSection::default(),
            log_level: default_log_level(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampling.period_ms == 0 {
            return Err(PidwattError::InvalidConfiguration(
                "sampling.period_ms must be > 0".to_string(),
            ));
        }
        if self.sampling.tick_hz == Some(0) {
            return Err(PidwattError::InvalidConfiguration(
                "sampling.tick_hz must be > 0".to_string(),
            ));
        }
        if self.sampling.logical_cores == Some(0) {
            return Err(PidwattError::InvalidConfiguration(
                "sampling.logical_cores must be > 0".to_string(),
            ));
        }
        IntervalClamp {
            min_secs: self.sampling.interval_min_s,
            max_secs: self.sampling.interval_max_s,
        }
        .validate()?;

        if log_level_filter(&self.log_level).is_none() {
            return Err(PidwattError::InvalidConfiguration(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Map a level name to a `log` filter
pub fn log_level_filter(level: &str) -> Option<log::LevelFilter> {
    level.parse::<log::LevelFilter>().ok()
}
