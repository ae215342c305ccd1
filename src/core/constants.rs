//! Default values shared across readers, the resolver and the loop

use std::time::Duration;

/// Sampling cadence
pub mod sampling {
    use super::Duration;

    /// Default period between two ticks
    pub const PERIOD: Duration = Duration::from_millis(1000);

    /// Kernel scheduling tick frequency assumed when it cannot be queried
    pub const FALLBACK_TICK_HZ: u64 = 100;

    /// Consecutive process-read failures before asking the resolver again
    pub const RERESOLVE_AFTER_FAILURES: u32 = 3;
}

/// Bounds applied to the measured wall-clock interval of a tick
pub mod interval {
    /// Shortest interval a reader will report, in seconds
    pub const MIN_SECS: f64 = 0.2;

    /// Longest interval a reader will report, in seconds
    pub const MAX_SECS: f64 = 5.0;
}

/// Delays used by strict identity re-validation
pub mod delays {
    use super::Duration;

    /// Pause between the first and the second identity check
    pub const STRICT: Duration = Duration::from_millis(150);
}

/// Timeouts for bounded external lookups
pub mod timeouts {
    use super::Duration;

    /// Deadline for one process listing or metadata lookup
    pub const LOOKUP: Duration = Duration::from_millis(5000);
}

/// Kernel interfaces
pub mod paths {
    /// Powercap root exposing RAPL domains
    pub const POWERCAP: &str = "/sys/class/powercap";

    /// Aggregate CPU-time record
    pub const PROC_STAT: &str = "/proc/stat";

    /// Static CPU description
    pub const CPUINFO: &str = "/proc/cpuinfo";

    /// Root of per-process records
    pub const PROC_ROOT: &str = "/proc";
}

/// Health endpoint defaults
pub mod http {
    use super::Duration;

    pub const LISTEN: &str = "0.0.0.0";
    pub const PORT: u16 = 9465;

    /// Age after which `/healthz` scans the powercap tree again
    pub const RAPL_PROBE_TTL: Duration = Duration::from_secs(5);
}

/// Floor for host active CPU-seconds when computing a share
pub const SHARE_EPSILON: f64 = 1e-6;
