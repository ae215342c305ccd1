//! Readers for the kernel counters the agent samples
//!
//! Every reader owns its baseline and turns successive cumulative readings
//! into per-interval quantities. The first call of each reader only primes
//! that baseline.

pub mod cpuinfo;
pub mod host_cpu;
pub mod process_cpu;
pub mod rapl;

pub use cpuinfo::{CpuInfoProfiler, CpuProfile};
pub use host_cpu::{CpuTimes, HostCpuSample, HostCpuTimeReader};
pub use process_cpu::{ProcessCpuSample, ProcessCpuTimeReader};
pub use rapl::{EnergyCounterReader, EnergySample, RaplProbe};
