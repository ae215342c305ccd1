use async_trait::async_trait;
use pidwatt::error::{PidwattError, Result};
use pidwatt::resolver::{ProcessIdentityResolver, ResolverOptions};
use pidwatt::sampling::{
    EnergySampler, HostCpuSampler, ProcessCpuSampler, Readers, SamplingLoop, TickOutcome,
};
use pidwatt::core::IntervalClamp;
use pidwatt::sensors::host_cpu::{HostCpuSample, HostCpuTimeReader};
use pidwatt::sensors::process_cpu::{ProcessCpuSample, ProcessCpuTimeReader};
use pidwatt::sensors::rapl::{self, EnergyCounterReader, EnergySample};
use pidwatt::{PublishedState, SamplingConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Constant 40 W, optionally slow, tracking how many calls overlap
struct FakeEnergy {
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeEnergy {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl EnergySampler for FakeEnergy {
    async fn sample(&mut self, _now: Instant) -> EnergySample {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        EnergySample {
            ok: true,
            interval_seconds: 1.0,
            delta_microjoules: 40_000_000,
            delta_joules: 40.0,
            average_power_watts: 40.0,
            wrap_count: 0,
            source_packages: Vec::new(),
        }
    }
}

/// Host with 2 active CPU-seconds per tick
struct FakeHost;

#[async_trait]
impl HostCpuSampler for FakeHost {
    async fn sample(&mut self, _now: Instant) -> Result<HostCpuSample> {
        Ok(HostCpuSample {
            interval_seconds: 1.0,
            host_active_seconds: 2.0,
            host_idle_seconds: 6.0,
            delta_active_ticks: 200,
            delta_idle_ticks: 600,
        })
    }
}

/// Target using 0.5 CPU-seconds per tick while `healthy` is set
struct FakeProcess {
    pid: Arc<AtomicU32>,
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessCpuSampler for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn retarget(&mut self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
    }

    async fn sample(&mut self) -> Result<ProcessCpuSample> {
        let pid = self.pid();
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(PidwattError::ProcessUnavailable {
                pid,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            });
        }
        Ok(ProcessCpuSample {
            pid,
            app_cpu_seconds: 0.5,
            restarted: false,
            ticks_now: 1000,
            ticks_delta: 50,
        })
    }
}

fn fake_process(pid: u32, healthy: bool) -> (FakeProcess, Arc<AtomicU32>, Arc<AtomicBool>) {
    let pid = Arc::new(AtomicU32::new(pid));
    let healthy = Arc::new(AtomicBool::new(healthy));
    (
        FakeProcess {
            pid: Arc::clone(&pid),
            healthy: Arc::clone(&healthy),
        },
        pid,
        healthy,
    )
}

fn config(period_ms: u64, reresolve_after: u32) -> SamplingConfig {
    SamplingConfig::builder()
        .period_ms(period_ms)
        .tick_hz(100)
        .logical_cores(4)
        .reresolve_after_failures(reresolve_after)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_tick_publishes_attribution() {
    let (process, _, _) = fake_process(77, true);
    let published = Arc::new(PublishedState::new());
    let sampling_loop = SamplingLoop::new(
        &config(1000, 3),
        Readers::new(FakeEnergy::new(Duration::ZERO), FakeHost, process),
        Arc::clone(&published),
    );

    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Published);

    let telemetry = published.latest().unwrap();
    assert_eq!(telemetry.cpu_distribution.target_pid, 77);
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.25);
    assert_eq!(telemetry.app_energy.average_power_watts, 10.0);
    assert_eq!(telemetry.app_energy.energy_joules_interval, 10.0);
    assert_eq!(telemetry.host_energy.average_power_watts, 40.0);
    assert_eq!(sampling_loop.stats().snapshot().published, 1);
}

#[tokio::test]
async fn test_tick_while_in_flight_is_skipped() {
    let energy = FakeEnergy::new(Duration::from_millis(200));
    let max_active = Arc::clone(&energy.max_active);
    let (process, _, _) = fake_process(77, true);
    let sampling_loop = SamplingLoop::new(
        &config(1000, 3),
        Readers::new(energy, FakeHost, process),
        Arc::new(PublishedState::new()),
    );

    let first = sampling_loop.tick().expect("first tick starts");
    assert!(sampling_loop.tick().is_none());
    assert!(sampling_loop.tick().is_none());
    first.await.unwrap();

    let stats = sampling_loop.stats().snapshot();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    // The gate reopens once the pass is done
    assert!(sampling_loop.tick().is_some());
}

#[tokio::test]
async fn test_slow_reader_never_overlaps_under_timer() {
    let energy = FakeEnergy::new(Duration::from_millis(120));
    let max_active = Arc::clone(&energy.max_active);
    let (process, _, _) = fake_process(77, true);
    let sampling_loop = SamplingLoop::new(
        &config(20, 3),
        Readers::new(energy, FakeHost, process),
        Arc::new(PublishedState::new()),
    );

    sampling_loop
        .run(tokio::time::sleep(Duration::from_millis(500)))
        .await;

    let stats = sampling_loop.stats().snapshot();
    assert!(stats.started >= 1);
    assert!(stats.skipped > 0, "{:?}", stats);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_tick_keeps_previous_record() {
    let (process, _, healthy) = fake_process(77, true);
    let published = Arc::new(PublishedState::new());
    let sampling_loop = SamplingLoop::new(
        &config(1000, 0),
        Readers::new(FakeEnergy::new(Duration::ZERO), FakeHost, process),
        Arc::clone(&published),
    );

    sampling_loop.tick().unwrap().await.unwrap();
    let first = published.latest().unwrap();

    healthy.store(false, Ordering::SeqCst);
    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed);

    let still = published.latest().unwrap();
    assert!(Arc::ptr_eq(&first, &still));
    let stats = sampling_loop.stats().snapshot();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_repeated_process_failures_trigger_reresolve() {
    let tmp = TempDir::new().unwrap();
    let pid_file = tmp.path().join("app.pid");
    let me = std::process::id();
    std::fs::write(&pid_file, me.to_string()).unwrap();
    let resolver = ProcessIdentityResolver::new(&ResolverOptions::from_file(&pid_file)).unwrap();

    let (process, pid, _) = fake_process(999_999, false);
    let published = Arc::new(PublishedState::new());
    let sampling_loop = SamplingLoop::new(
        &config(1000, 2),
        Readers::new(FakeEnergy::new(Duration::ZERO), FakeHost, process),
        Arc::clone(&published),
    )
    .with_resolver(Arc::new(resolver))
    .unwrap();

    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed);
    assert_eq!(pid.load(Ordering::SeqCst), 999_999);

    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed);
    assert_eq!(pid.load(Ordering::SeqCst), me);

    // Retargeted reader starts a new window; the pass after it publishes
    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Realigned);
    assert!(published.latest().is_none());

    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Published);
    assert_eq!(published.latest().unwrap().cpu_distribution.target_pid, me);
}

#[tokio::test]
async fn test_unreadable_energy_does_not_publish() {
    struct DeadEnergy;

    #[async_trait]
    impl EnergySampler for DeadEnergy {
        async fn sample(&mut self, _now: Instant) -> EnergySample {
            EnergySample {
                ok: false,
                interval_seconds: 0.2,
                delta_microjoules: 0,
                delta_joules: 0.0,
                average_power_watts: 0.0,
                wrap_count: 0,
                source_packages: Vec::new(),
            }
        }
    }

    let (process, _, _) = fake_process(77, true);
    let published = Arc::new(PublishedState::new());
    let sampling_loop = SamplingLoop::new(
        &config(1000, 3),
        Readers::new(DeadEnergy, FakeHost, process),
        Arc::clone(&published),
    );

    let outcome = sampling_loop.tick().unwrap().await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed);
    assert!(published.latest().is_none());
}

const TARGET: u32 = 4242;

/// Powercap, /proc/stat and /proc/<pid>/stat files for the real readers
struct HostFixture {
    _tmp: TempDir,
    powercap: PathBuf,
    proc_root: PathBuf,
    host_stat: PathBuf,
    energy_uj: u64,
    host_active: u64,
    app_ticks: u64,
}

impl HostFixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let powercap = tmp.path().join("powercap");
        let package = powercap.join("intel-rapl:0");
        fs::create_dir_all(&package).unwrap();
        fs::write(package.join("name"), "package-0\n").unwrap();
        fs::write(package.join("max_energy_range_uj"), "262143328850\n").unwrap();

        let proc_root = tmp.path().join("proc");
        fs::create_dir_all(proc_root.join(TARGET.to_string())).unwrap();
        let host_stat = tmp.path().join("stat");

        let fixture = Self {
            _tmp: tmp,
            powercap,
            proc_root,
            host_stat,
            energy_uj: 5_000_000,
            host_active: 10_000,
            app_ticks: 1_000,
        };
        fixture.write_energy();
        fixture.write_host();
        fixture.write_process(9_954_766);
        fixture
    }

    fn write_energy(&self) {
        fs::write(
            self.powercap.join("intel-rapl:0").join("energy_uj"),
            format!("{}\n", self.energy_uj),
        )
        .unwrap();
    }

    fn write_host(&self) {
        fs::write(
            &self.host_stat,
            format!("cpu  {} 0 0 50000 0 0 0 0 0 0\n", self.host_active),
        )
        .unwrap();
    }

    fn process_stat(&self) -> PathBuf {
        self.proc_root.join(TARGET.to_string()).join("stat")
    }

    fn write_process(&self, starttime: u64) {
        let line = format!(
            "{pid} (worker) S 1 {pid} {pid} 0 -1 4194560 18391 0 1 0 {utime} 0 0 0 20 0 11 0 {starttime} \
1278586880 17245 18446744073709551615 1 1 0 0 0 0 0 16781312 134235650 0 0 0 17 1 0 0 0 0 0 0 0 0 0 0 0 0 0\n",
            pid = TARGET,
            utime = self.app_ticks,
        );
        fs::write(self.process_stat(), line).unwrap();
    }

    /// Advance the counters by one tick: 1 J of energy, `host` active and
    /// `app` target ticks
    fn advance(&mut self, host: u64, app: u64) {
        self.energy_uj += 1_000_000;
        self.host_active += host;
        self.app_ticks += app;
        self.write_energy();
        self.write_host();
    }

    async fn sampling_loop(&self, published: Arc<PublishedState>) -> SamplingLoop {
        let probe = rapl::probe(&self.powercap).await;
        let clamp = IntervalClamp::default();
        let readers = Readers::new(
            EnergyCounterReader::from_probe(&probe, clamp),
            HostCpuTimeReader::with_stat_path(&self.host_stat, 100, clamp),
            ProcessCpuTimeReader::with_proc_root(&self.proc_root, TARGET, 100),
        );
        SamplingLoop::new(&config(1000, 0), readers, published)
    }
}

async fn tick(sampling_loop: &SamplingLoop) -> TickOutcome {
    sampling_loop.tick().unwrap().await.unwrap()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn test_missed_process_read_does_not_skew_next_share() {
    let mut fx = HostFixture::new();
    let published = Arc::new(PublishedState::new());
    let sampling_loop = fx.sampling_loop(Arc::clone(&published)).await;

    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);
    let primed = published.latest().unwrap();
    assert_eq!(primed.cpu_distribution.app_share_ratio, 0.0);

    // Target unreadable for one tick while host and energy move on
    fx.advance(100, 50);
    fs::remove_file(fx.process_stat()).unwrap();
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Failed);

    // Process delta would now span two ticks against one of host time
    fx.advance(100, 50);
    fx.write_process(9_954_766);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Realigned);
    assert!(Arc::ptr_eq(&primed, &published.latest().unwrap()));

    fx.advance(100, 50);
    fx.write_process(9_954_766);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);

    let telemetry = published.latest().unwrap();
    assert_eq!(telemetry.cpu_distribution.host_cpu_seconds_interval, 1.0);
    assert_eq!(telemetry.cpu_distribution.app_cpu_seconds_interval, 0.5);
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.5);
    assert!(approx(telemetry.host_energy.energy_joules_interval, 1.0));
    assert!(approx(telemetry.app_energy.energy_joules_interval, 0.5));

    let stats = sampling_loop.stats().snapshot();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.realigned, 1);
}

#[tokio::test]
async fn test_missed_host_read_does_not_skew_next_share() {
    let mut fx = HostFixture::new();
    let published = Arc::new(PublishedState::new());
    let sampling_loop = fx.sampling_loop(Arc::clone(&published)).await;
    tick(&sampling_loop).await;

    fx.advance(100, 50);
    fx.write_process(9_954_766);
    fs::write(&fx.host_stat, "intr 1 2 3\n").unwrap();
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Failed);

    fx.advance(100, 50);
    fx.write_process(9_954_766);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Realigned);

    fx.advance(200, 50);
    fx.write_process(9_954_766);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);
    let telemetry = published.latest().unwrap();
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.25);
    assert!(approx(telemetry.host_energy.energy_joules_interval, 1.0));
}

#[tokio::test]
async fn test_restarted_target_is_flagged_in_published_record() {
    let mut fx = HostFixture::new();
    let published = Arc::new(PublishedState::new());
    let sampling_loop = fx.sampling_loop(Arc::clone(&published)).await;
    tick(&sampling_loop).await;

    fx.advance(100, 50);
    fx.write_process(9_954_766);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);
    let telemetry = published.latest().unwrap();
    assert!(!telemetry.cpu_distribution.pid_restarted);
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.5);

    // Same PID, new start time: a different process
    fx.advance(100, 50);
    fx.write_process(10_000_000);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);
    let telemetry = published.latest().unwrap();
    assert!(telemetry.cpu_distribution.pid_restarted);
    assert_eq!(telemetry.cpu_distribution.target_pid, TARGET);
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.0);
    assert_eq!(telemetry.app_energy.energy_joules_interval, 0.0);

    let json = serde_json::to_value(&*telemetry).unwrap();
    assert_eq!(json["cpuDistribution"]["pidRestarted"], true);

    fx.advance(100, 25);
    fx.write_process(10_000_000);
    assert_eq!(tick(&sampling_loop).await, TickOutcome::Published);
    let telemetry = published.latest().unwrap();
    assert!(!telemetry.cpu_distribution.pid_restarted);
    assert_eq!(telemetry.cpu_distribution.app_share_ratio, 0.25);
}
