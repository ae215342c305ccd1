//! Periodic sampling loop
//!
//! One timer drives ticks. Each tick fans out to the energy, host CPU and
//! process CPU readers concurrently, waits for all three, attributes a
//! share of host power to the target by CPU time and publishes the record.
//!
//! Every published record combines deltas taken over the same window. When
//! a reader fails, the others have already moved their baselines on, so the
//! next complete pass only re-establishes baselines and publishes nothing.
//!
//! At most one sampling pass runs at a time. A tick that finds the previous
//! pass still in flight is dropped, not queued, so slow I/O can never pile
//! up work or let two passes race on the same reader baselines.

use crate::config::SamplingConfig;
use crate::core::constants::SHARE_EPSILON;
use crate::error::{PidwattError, Result};
use crate::resolver::ProcessIdentityResolver;
use crate::sensors::host_cpu::{HostCpuSample, HostCpuTimeReader};
use crate::sensors::process_cpu::{ProcessCpuSample, ProcessCpuTimeReader};
use crate::sensors::rapl::{EnergyCounterReader, EnergySample};
use crate::telemetry::{PublishedState, Telemetry};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Source of interval energy
#[async_trait]
pub trait EnergySampler: Send + Sync {
    async fn sample(&mut self, now: Instant) -> EnergySample;
}

/// Source of host-wide CPU time
#[async_trait]
pub trait HostCpuSampler: Send + Sync {
    async fn sample(&mut self, now: Instant) -> Result<HostCpuSample>;
}

/// Source of the target's CPU time
#[async_trait]
pub trait ProcessCpuSampler: Send + Sync {
    fn pid(&self) -> u32;

    /// Follow another PID from the next sample on
    fn retarget(&mut self, pid: u32);

    async fn sample(&mut self) -> Result<ProcessCpuSample>;
}

#[async_trait]
impl EnergySampler for EnergyCounterReader {
    async fn sample(&mut self, now: Instant) -> EnergySample {
        EnergyCounterReader::sample(self, now).await
    }
}

#[async_trait]
impl HostCpuSampler for HostCpuTimeReader {
    async fn sample(&mut self, now: Instant) -> Result<HostCpuSample> {
        HostCpuTimeReader::sample(self, now).await
    }
}

#[async_trait]
impl ProcessCpuSampler for ProcessCpuTimeReader {
    fn pid(&self) -> u32 {
        ProcessCpuTimeReader::pid(self)
    }

    fn retarget(&mut self, pid: u32) {
        ProcessCpuTimeReader::retarget(self, pid)
    }

    async fn sample(&mut self) -> Result<ProcessCpuSample> {
        ProcessCpuTimeReader::sample(self).await
    }
}

/// The three readers a pass drives
pub struct Readers {
    pub energy: Box<dyn EnergySampler>,
    pub host: Box<dyn HostCpuSampler>,
    pub process: Box<dyn ProcessCpuSampler>,
}

impl Readers {
    pub fn new(
        energy: impl EnergySampler + 'static,
        host: impl HostCpuSampler + 'static,
        process: impl ProcessCpuSampler + 'static,
    ) -> Self {
        Self {
            energy: Box::new(energy),
            host: Box::new(host),
            process: Box::new(process),
        }
    }
}

/// Share of host power and energy attributed to the target
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Attribution {
    pub cpu_share: f64,
    pub power_watts: f64,
    pub energy_joules: f64,
}

/// Attribute host power to the target by its share of active CPU time.
///
/// The share is capped at the number of logical cores; a near-zero host
/// active time is floored at [`SHARE_EPSILON`].
pub fn attribute(
    app_cpu_seconds: f64,
    host_active_seconds: f64,
    host_power_watts: f64,
    interval_seconds: f64,
    logical_cores: usize,
) -> Attribution {
    let share = app_cpu_seconds / host_active_seconds.max(SHARE_EPSILON);
    let cpu_share = if share.is_finite() {
        share.clamp(0.0, logical_cores.max(1) as f64)
    } else {
        0.0
    };
    let power_watts = cpu_share * host_power_watts;
    Attribution {
        cpu_share,
        power_watts,
        energy_joules: power_watts * interval_seconds,
    }
}

/// Counters describing the loop's history
#[derive(Debug, Default)]
pub struct LoopStats {
    started: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    realigned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoopStatsSnapshot {
    pub started: u64,
    pub skipped: u64,
    pub published: u64,
    pub failed: u64,
    /// Complete passes spent re-establishing baselines after a failure
    pub realigned: u64,
}

impl LoopStats {
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            realigned: self.realigned.load(Ordering::Relaxed),
        }
    }
}

/// How a started pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    /// At least one reader produced no data; nothing was published
    Failed,
    /// All readers produced data but over different windows; nothing was
    /// published and the next pass is aligned again
    Realigned,
}

struct LoopShared {
    readers: Mutex<Readers>,
    resolver: Option<Arc<ProcessIdentityResolver>>,
    published: Arc<PublishedState>,
    stats: Arc<LoopStats>,
    in_flight: AtomicBool,
    /// Reader baselines no longer cover the same window
    misaligned: AtomicBool,
    process_failures: AtomicU32,
    logical_cores: usize,
    reresolve_after: u32,
}

/// Clears the in-flight flag when a pass ends, including by panic
struct InFlightGuard(Arc<LoopShared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Drives non-overlapping sampling passes
pub struct SamplingLoop {
    period: Duration,
    shared: Arc<LoopShared>,
}

impl SamplingLoop {
    pub fn new(config: &SamplingConfig, readers: Readers, published: Arc<PublishedState>) -> Self {
        Self {
            period: config.period,
            shared: Arc::new(LoopShared {
                readers: Mutex::new(readers),
                resolver: None,
                published,
                stats: Arc::new(LoopStats::default()),
                in_flight: AtomicBool::new(false),
                misaligned: AtomicBool::new(false),
                process_failures: AtomicU32::new(0),
                logical_cores: config.logical_cores,
                reresolve_after: config.reresolve_after_failures,
            }),
        }
    }

    /// Re-resolve the target after repeated process read failures
    pub fn with_resolver(mut self, resolver: Arc<ProcessIdentityResolver>) -> Result<Self> {
        let shared = Arc::get_mut(&mut self.shared).ok_or_else(|| {
            PidwattError::InvalidConfiguration("resolver must be set before the loop runs".into())
        })?;
        shared.resolver = Some(resolver);
        Ok(self)
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn published(&self) -> Arc<PublishedState> {
        Arc::clone(&self.shared.published)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start a pass unless one is already running.
    ///
    /// Returns `None` when the tick was skipped.
    pub fn tick(&self) -> Option<JoinHandle<TickOutcome>> {
        let stats = &self.shared.stats;
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("tick.skipped pass still in flight");
            return None;
        }
        stats.started.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard(Arc::clone(&self.shared));
        Some(tokio::spawn(async move {
            let outcome = run_pass(&guard.0).await;
            drop(guard);
            outcome
        }))
    }

    /// Tick every period until `shutdown` completes. The first tick fires
    /// immediately.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!("loop.start period_ms={}", self.period.as_millis());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        let stats = self.shared.stats.snapshot();
        info!(
            "loop.stop started={} skipped={} published={} failed={} realigned={}",
            stats.started, stats.skipped, stats.published, stats.failed, stats.realigned
        );
    }
}

async fn run_pass(shared: &LoopShared) -> TickOutcome {
    let now = Instant::now();
    let mut readers = shared.readers.lock().await;
    let Readers {
        energy,
        host,
        process,
    } = &mut *readers;

    let (energy_sample, host_sample, process_sample) =
        tokio::join!(energy.sample(now), host.sample(now), process.sample());

    let process_sample = match process_sample {
        Ok(sample) => {
            shared.process_failures.store(0, Ordering::Relaxed);
            Some(sample)
        }
        Err(e) => {
            warn!("tick.fail process pid={}: {}", process.pid(), e);
            let failures = shared.process_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if shared.reresolve_after > 0 && failures >= shared.reresolve_after {
                reresolve(shared, process).await;
            }
            None
        }
    };

    let host_sample = match host_sample {
        Ok(sample) => Some(sample),
        Err(e) => {
            warn!("tick.fail host: {}", e);
            None
        }
    };
    if !energy_sample.ok {
        warn!("tick.fail energy: no counter could be read");
    }

    let (Some(host_sample), Some(process_sample), true) =
        (host_sample, process_sample, energy_sample.ok)
    else {
        shared.misaligned.store(true, Ordering::Relaxed);
        shared.stats.failed.fetch_add(1, Ordering::Relaxed);
        return TickOutcome::Failed;
    };

    if shared.misaligned.swap(false, Ordering::Relaxed) {
        debug!("tick.realigned pid={} baselines reset", process_sample.pid);
        shared.stats.realigned.fetch_add(1, Ordering::Relaxed);
        return TickOutcome::Realigned;
    }

    let attribution = attribute(
        process_sample.app_cpu_seconds,
        host_sample.host_active_seconds,
        energy_sample.average_power_watts,
        energy_sample.interval_seconds,
        shared.logical_cores,
    );
    debug!(
        "tick.ok pid={} share={:.4} app_w={:.3} host_w={:.3}",
        process_sample.pid,
        attribution.cpu_share,
        attribution.power_watts,
        energy_sample.average_power_watts
    );

    shared.published.publish(Telemetry::new(
        &energy_sample,
        &host_sample,
        &process_sample,
        &attribution,
        Utc::now(),
    ));
    shared.stats.published.fetch_add(1, Ordering::Relaxed);
    TickOutcome::Published
}

/// Ask the resolver for the target again and follow it if it moved
async fn reresolve(shared: &LoopShared, process: &mut Box<dyn ProcessCpuSampler>) {
    let Some(resolver) = &shared.resolver else {
        return;
    };
    shared.process_failures.store(0, Ordering::Relaxed);

    match resolver.resolve().await {
        Ok(identity) if identity.pid != process.pid() => {
            info!("target.moved {} -> {}", process.pid(), identity.pid);
            process.retarget(identity.pid);
        }
        Ok(identity) => debug!("target.unchanged pid={}", identity.pid),
        Err(e) => warn!("target.reresolve.fail code={} {}", e.code(), e),
    }
}
