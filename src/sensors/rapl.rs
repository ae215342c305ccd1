//! RAPL energy counters exposed through powercap
//!
//! Each package domain (`intel-rapl:N`, `amd-rapl:N`) exposes a cumulative
//! `energy_uj` counter and, usually, the `max_energy_range_uj` modulus at
//! which it wraps back to zero. [`probe`] discovers the domains and
//! [`EnergyCounterReader`] turns successive counter values into interval
//! energy and average power.

use crate::core::interval::IntervalClamp;
use crate::health::HealthStatus;
use futures::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// CPU vendor inferred from the powercap node name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    fn from_node(node: &str) -> Self {
        if node.starts_with("intel-rapl") {
            Vendor::Intel
        } else if node.starts_with("amd-rapl") {
            Vendor::Amd
        } else {
            Vendor::Unknown
        }
    }
}

/// One discovered package domain
#[derive(Debug, Clone, Serialize)]
pub struct RaplPackage {
    pub vendor: Vendor,
    /// Directory name under the powercap root, e.g. `intel-rapl:0`
    pub node: String,
    pub path: PathBuf,
    /// Content of the `name` file, e.g. `package-0`
    pub name: String,
    pub readable: bool,
    /// Why `energy_uj` is not readable
    pub reason: Option<String>,
    pub max_energy_range_uj: Option<u64>,
    /// Canonical path of the `energy_uj` counter
    pub energy_file: PathBuf,
}

/// Result of scanning the powercap tree
#[derive(Debug, Clone, Serialize)]
pub struct RaplProbe {
    pub status: HealthStatus,
    pub vendor: Vendor,
    pub packages: Vec<RaplPackage>,
    pub hint: Option<String>,
}

impl RaplProbe {
    fn failed(hint: String) -> Self {
        Self {
            status: HealthStatus::Failed,
            vendor: Vendor::Unknown,
            packages: Vec::new(),
            hint: Some(hint),
        }
    }

    /// Derive the status from the discovered packages.
    ///
    /// No package is FAILED, packages without a single readable counter
    /// are DEGRADED, anything readable is OK.
    pub fn from_packages(packages: Vec<RaplPackage>) -> Self {
        if packages.is_empty() {
            return Self::failed(
                "No RAPL packages found (intel-rapl:N or amd-rapl:N). VM without powercap?"
                    .to_string(),
            );
        }

        let first_readable = packages.iter().find(|p| p.readable);
        let any_readable = first_readable.is_some();
        let vendor = first_readable
            .map(|p| p.vendor)
            .unwrap_or(packages[0].vendor);

        if any_readable {
            Self {
                status: HealthStatus::Ok,
                vendor,
                packages,
                hint: None,
            }
        } else {
            Self {
                status: HealthStatus::Degraded,
                vendor,
                packages,
                hint: Some(
                    "RAPL present but unreadable (permissions). Run the agent as root or grant read access to energy_uj."
                        .to_string(),
                ),
            }
        }
    }

    /// Packages whose counter can actually be read
    pub fn readable_packages(&self) -> impl Iterator<Item = &RaplPackage> {
        self.packages.iter().filter(|p| p.readable)
    }
}

fn reason_from_error(err: &io::Error) -> String {
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EACCES => return "permission_denied".to_string(),
            libc::EPERM => return "operation_not_permitted".to_string(),
            libc::ENOENT => return "not_found".to_string(),
            libc::ELOOP => return "symlink_loop".to_string(),
            libc::ENOTDIR => return "not_a_directory".to_string(),
            _ => {}
        }
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => "permission_denied".to_string(),
        io::ErrorKind::NotFound => "not_found".to_string(),
        kind => kind.to_string().to_lowercase().replace(' ', "_"),
    }
}

async fn read_u64(path: &Path) -> io::Result<u64> {
    let raw = tokio::fs::read_to_string(path).await?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn inspect_package(dir: PathBuf, node: String) -> Option<RaplPackage> {
    let name = tokio::fs::read_to_string(dir.join("name")).await.ok()?;
    let name = name.trim().to_string();
    if !name.contains("package-") {
        return None;
    }

    let energy_path = dir.join("energy_uj");
    let max_path = dir.join("max_energy_range_uj");
    let (open, max_range) = tokio::join!(
        tokio::fs::File::open(&energy_path),
        read_u64(&max_path),
    );
    let (readable, reason) = match open {
        Ok(_) => (true, None),
        Err(e) => (false, Some(reason_from_error(&e))),
    };
    let energy_file = tokio::fs::canonicalize(&energy_path)
        .await
        .unwrap_or(energy_path);

    Some(RaplPackage {
        vendor: Vendor::from_node(&node),
        node,
        path: dir,
        name,
        readable,
        reason,
        max_energy_range_uj: max_range.ok(),
        energy_file,
    })
}

/// Scan a powercap root for package energy counters
pub async fn probe(base_path: impl AsRef<Path>) -> RaplProbe {
    let base_path = base_path.as_ref();
    let mut entries = match tokio::fs::read_dir(base_path).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("rapl.probe.unreadable {}: {}", base_path.display(), e);
            return RaplProbe::failed(format!("{} not accessible", base_path.display()));
        }
    };

    let mut candidates = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir_like = match entry.file_type().await {
                    Ok(ft) => ft.is_dir() || ft.is_symlink(),
                    Err(_) => false,
                };
                if is_dir_like {
                    let node = entry.file_name().to_string_lossy().to_string();
                    candidates.push(inspect_package(entry.path(), node));
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("rapl.probe.listing {}: {}", base_path.display(), e);
                break;
            }
        }
    }

    let mut packages: Vec<RaplPackage> = join_all(candidates).await.into_iter().flatten().collect();
    packages.sort_by(|a, b| a.node.cmp(&b.node));
    RaplProbe::from_packages(packages)
}

/// Counter source handed to the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSource {
    pub node: String,
    pub energy_file: PathBuf,
    /// Modulus at which the counter wraps, if known
    pub max_range_uj: Option<u64>,
}

impl From<&RaplPackage> for CounterSource {
    fn from(pkg: &RaplPackage) -> Self {
        Self {
            node: pkg.node.clone(),
            energy_file: pkg.energy_file.clone(),
            max_range_uj: pkg.max_energy_range_uj,
        }
    }
}

#[derive(Debug)]
struct CounterState {
    source: CounterSource,
    last_uj: Option<u64>,
}

/// Energy consumed by one package during a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageDelta {
    pub node: String,
    pub delta_microjoules: u128,
    pub wrapped: bool,
}

/// Interval energy over all packages. Created once per tick, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergySample {
    pub ok: bool,
    pub interval_seconds: f64,
    pub delta_microjoules: u128,
    pub delta_joules: f64,
    pub average_power_watts: f64,
    pub wrap_count: u32,
    pub source_packages: Vec<PackageDelta>,
}

impl EnergySample {
    fn primed(ok: bool, interval_seconds: f64) -> Self {
        Self {
            ok,
            interval_seconds,
            delta_microjoules: 0,
            delta_joules: 0.0,
            average_power_watts: 0.0,
            wrap_count: 0,
            source_packages: Vec::new(),
        }
    }
}

/// Delta between two counter readings, corrected for a single wrap.
///
/// Returns the delta and whether a wrap was applied, or `None` when the
/// counter went backwards and no modulus is known.
pub fn counter_delta(last: u64, current: u64, max_range: Option<u64>) -> Option<(u128, bool)> {
    if current >= last {
        return Some(((current - last) as u128, false));
    }
    let max_range = max_range?;
    (current as u128 + max_range as u128)
        .checked_sub(last as u128)
        .map(|delta| (delta, true))
}

/// Converts cumulative package counters into interval energy and power
#[derive(Debug)]
pub struct EnergyCounterReader {
    counters: Vec<CounterState>,
    clamp: IntervalClamp,
    last_instant: Option<Instant>,
}

impl EnergyCounterReader {
    pub fn new(sources: Vec<CounterSource>, clamp: IntervalClamp) -> Self {
        Self {
            counters: sources
                .into_iter()
                .map(|source| CounterState {
                    source,
                    last_uj: None,
                })
                .collect(),
            clamp,
            last_instant: None,
        }
    }

    /// Build a reader over the readable packages of a probe
    pub fn from_probe(probe: &RaplProbe, clamp: IntervalClamp) -> Self {
        Self::new(
            probe.readable_packages().map(CounterSource::from).collect(),
            clamp,
        )
    }

    pub fn source_count(&self) -> usize {
        self.counters.len()
    }

    /// Take one reading of every counter and return the interval energy.
    ///
    /// The first call only records baselines. A counter that cannot be
    /// read is skipped for this tick and primes again on its next read, so
    /// no delta ever spans more than one tick. One that went backwards without a
    /// known modulus contributes nothing but still gets its baseline
    /// refreshed.
    pub async fn sample(&mut self, now: Instant) -> EnergySample {
        let reads = join_all(
            self.counters
                .iter()
                .map(|c| read_u64(&c.source.energy_file)),
        )
        .await;

        let Some(last_instant) = self.last_instant.replace(now) else {
            for (counter, read) in self.counters.iter_mut().zip(reads) {
                match read {
                    Ok(value) => counter.last_uj = Some(value),
                    Err(e) => debug!("rapl.prime.fail {}: {}", counter.source.node, e),
                }
            }
            return EnergySample::primed(!self.counters.is_empty(), self.clamp.clamp(0.0));
        };

        let mut total_uj: u128 = 0;
        let mut wraps = 0u32;
        let mut any_read = false;
        let mut packages = Vec::new();

        for (counter, read) in self.counters.iter_mut().zip(reads) {
            let current = match read {
                Ok(value) => value,
                Err(e) => {
                    debug!("rapl.read.fail {}: {}", counter.source.node, e);
                    counter.last_uj = None;
                    continue;
                }
            };
            any_read = true;

            let Some(last) = counter.last_uj.replace(current) else {
                continue;
            };

            match counter_delta(last, current, counter.source.max_range_uj) {
                Some((delta, wrapped)) => {
                    if wrapped {
                        wraps += 1;
                        debug!(
                            "rapl.wrap {}: {} -> {} (max {:?})",
                            counter.source.node, last, current, counter.source.max_range_uj
                        );
                    }
                    total_uj += delta;
                    packages.push(PackageDelta {
                        node: counter.source.node.clone(),
                        delta_microjoules: delta,
                        wrapped,
                    });
                }
                None => warn!(
                    "rapl.negative_delta {}: {} -> {} without max_energy_range_uj, skipped",
                    counter.source.node, last, current
                ),
            }
        }

        let interval_seconds = self.clamp.between(last_instant, now);
        let delta_joules = total_uj as f64 / 1e6;

        EnergySample {
            ok: any_read,
            interval_seconds,
            delta_microjoules: total_uj,
            delta_joules,
            average_power_watts: delta_joules / interval_seconds,
            wrap_count: wraps,
            source_packages: packages,
        }
    }
}
