//! Static host CPU profile from /proc/cpuinfo
//!
//! Vendor, model, core counts, the current frequency spread across logical
//! CPUs and a few capability flags. Used by the `cpu` subcommand to show
//! what kind of host the energy numbers come from.

use crate::core::constants::paths;
use crate::error::{PidwattError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Flag groups reported alongside the derived capabilities
const FLAG_GROUPS: &[(&str, &[&str])] = &[
    ("virtualization", &["vmx", "svm", "ept", "npt", "tpr_shadow", "vme"]),
    (
        "security",
        &["nx", "smap", "smep", "md_clear", "pti", "lahf_lm", "rdtscp"],
    ),
    ("crypto", &["aes", "rdrand", "rdseed", "sha_ni"]),
    (
        "performance",
        &[
            "sse", "sse2", "sse3", "ssse3", "sse4_1", "sse4_2", "avx", "avx2", "fma", "mmx",
            "pni", "popcnt", "xsave", "xsaveopt", "xsavec", "xsaves",
        ],
    ),
    (
        "management",
        &["hwp", "tsc", "cpuid", "clflush", "invariant_tsc", "constant_tsc"],
    ),
];

/// One `processor` block, keys lowercased with spaces as underscores
pub type CpuRecord = BTreeMap<String, String>;

/// Split cpuinfo content into one record per logical CPU
pub fn parse_cpuinfo(content: &str) -> Vec<CpuRecord> {
    let mut records = Vec::new();
    let mut current = CpuRecord::new();

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("processor") && !current.is_empty() {
            records.push(std::mem::take(&mut current));
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase().replace(' ', "_");
        if key.is_empty() {
            continue;
        }
        current.insert(key, value.trim().to_string());
    }
    if !current.is_empty() {
        records.push(current);
    }
    records.retain(|r| r.contains_key("processor"));
    records
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub virtualisable: bool,
    pub aes_support: bool,
    pub hyper_threading: bool,
    pub secure_boot_capable: bool,
}

impl Capabilities {
    pub fn from_flags(flags: &[&str]) -> Self {
        let has = |f: &str| flags.contains(&f);
        Self {
            virtualisable: has("vmx") || has("svm"),
            aes_support: has("aes"),
            hyper_threading: has("ht"),
            secure_boot_capable: has("nx") && has("smap") && has("smep"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreCounts {
    pub physical: Option<u32>,
    pub logical: u32,
}

/// Current clock of the logical CPUs, in MHz
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencySpread {
    pub unit: &'static str,
    pub total: f64,
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub spread: f64,
    /// Average over max; 1.0 when every CPU runs at the top clock
    pub load_estimate: f64,
}

impl FrequencySpread {
    fn from_mhz(mhz: &[f64]) -> Option<Self> {
        if mhz.is_empty() {
            return None;
        }
        let total: f64 = mhz.iter().sum();
        let max = mhz.iter().copied().fold(f64::MIN, f64::max);
        let min = mhz.iter().copied().fold(f64::MAX, f64::min);
        let average = total / mhz.len() as f64;
        Some(Self {
            unit: "MHz",
            total,
            average,
            max,
            min,
            spread: max - min,
            load_estimate: if max > 0.0 { average / max } else { 0.0 },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfile {
    pub timestamp_utc: DateTime<Utc>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub cores: CoreCounts,
    /// Absent on architectures that do not report `cpu MHz`
    pub frequency: Option<FrequencySpread>,
    pub cache: Option<String>,
    pub power_management: Option<String>,
    pub capabilities: Capabilities,
    pub flag_groups: BTreeMap<&'static str, Vec<String>>,
}

impl CpuProfile {
    /// Summarise parsed records; the first CPU stands for the package
    pub fn from_records(records: &[CpuRecord], timestamp_utc: DateTime<Utc>) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| PidwattError::parse("/proc/cpuinfo", "no processor entries"))?;
        let field = |key: &str| first.get(key).cloned();

        let flags: Vec<&str> = first
            .get("flags")
            .map(|f| f.split_whitespace().collect())
            .unwrap_or_default();
        let flag_groups = FLAG_GROUPS
            .iter()
            .map(|(group, members)| {
                let present = flags
                    .iter()
                    .filter(|f| members.contains(*f))
                    .map(|f| f.to_string())
                    .collect();
                (*group, present)
            })
            .collect();

        let mhz: Vec<f64> = records
            .iter()
            .filter_map(|r| r.get("cpu_mhz")?.parse::<f64>().ok())
            .collect();

        let logical = first
            .get("siblings")
            .and_then(|s| s.parse().ok())
            .unwrap_or(records.len() as u32);

        Ok(Self {
            timestamp_utc,
            vendor: field("vendor_id"),
            model: field("model_name"),
            cores: CoreCounts {
                physical: first.get("cpu_cores").and_then(|c| c.parse().ok()),
                logical,
            },
            frequency: FrequencySpread::from_mhz(&mhz),
            cache: field("cache_size"),
            power_management: field("power_management"),
            capabilities: Capabilities::from_flags(&flags),
            flag_groups,
        })
    }
}

/// Reads and summarises a cpuinfo file
#[derive(Debug, Clone)]
pub struct CpuInfoProfiler {
    path: PathBuf,
}

impl Default for CpuInfoProfiler {
    fn default() -> Self {
        Self::with_path(paths::CPUINFO)
    }
}

impl CpuInfoProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Every logical CPU's record
    pub async fn records(&self) -> Result<Vec<CpuRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_cpuinfo(&content))
    }

    pub async fn profile(&self) -> Result<CpuProfile> {
        let records = self.records().await?;
        CpuProfile::from_records(&records, Utc::now())
    }
}
