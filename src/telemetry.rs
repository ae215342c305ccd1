//! Published telemetry record and the slot holding the latest one

use crate::sampling::Attribution;
use crate::sensors::host_cpu::HostCpuSample;
use crate::sensors::process_cpu::ProcessCpuSample;
use crate::sensors::rapl::EnergySample;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Whole-host energy over one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEnergy {
    pub average_power_watts: f64,
    pub energy_joules_interval: f64,
    pub interval_seconds: f64,
    pub timestamp_utc: DateTime<Utc>,
    pub wrap_count: u32,
}

/// How host CPU time split between the target and everything else
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuDistribution {
    pub target_pid: u32,
    pub host_cpu_seconds_interval: f64,
    pub app_cpu_seconds_interval: f64,
    pub app_share_ratio: f64,
    pub pid_restarted: bool,
}

/// Energy attributed to the target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEnergy {
    pub average_power_watts: f64,
    pub energy_joules_interval: f64,
}

/// One tick's worth of telemetry, published as a unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub host_energy: HostEnergy,
    pub cpu_distribution: CpuDistribution,
    pub app_energy: AppEnergy,
}

impl Telemetry {
    pub fn new(
        energy: &EnergySample,
        host: &HostCpuSample,
        process: &ProcessCpuSample,
        attribution: &Attribution,
        timestamp_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            host_energy: HostEnergy {
                average_power_watts: energy.average_power_watts,
                energy_joules_interval: energy.delta_joules,
                interval_seconds: energy.interval_seconds,
                timestamp_utc,
                wrap_count: energy.wrap_count,
            },
            cpu_distribution: CpuDistribution {
                target_pid: process.pid,
                host_cpu_seconds_interval: host.host_active_seconds,
                app_cpu_seconds_interval: process.app_cpu_seconds,
                app_share_ratio: attribution.cpu_share,
                pid_restarted: process.restarted,
            },
            app_energy: AppEnergy {
                average_power_watts: attribution.power_watts,
                energy_joules_interval: attribution.energy_joules,
            },
        }
    }
}

/// Latest published telemetry.
///
/// Written only by the sampling loop; any number of readers. Each publish
/// swaps in a whole new record, so a reader sees either the old or the new
/// record and never a mix.
#[derive(Debug, Default)]
pub struct PublishedState {
    slot: ArcSwapOption<Telemetry>,
}

impl PublishedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, telemetry: Telemetry) {
        self.slot.store(Some(Arc::new(telemetry)));
    }

    pub fn latest(&self) -> Option<Arc<Telemetry>> {
        self.slot.load_full()
    }
}
