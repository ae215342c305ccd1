//! Interval clamping shared by every reader
//!
//! Readers divide counter deltas by the elapsed wall-clock time. After a
//! VM freeze or a suspend/resume the raw interval is meaningless, so it is
//! silently pulled back into a `[min, max]` band instead of being reported
//! as an error.

use crate::core::constants::interval;
use crate::error::{PidwattError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Inclusive band applied to measured intervals, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalClamp {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl Default for IntervalClamp {
    fn default() -> Self {
        Self {
            min_secs: interval::MIN_SECS,
            max_secs: interval::MAX_SECS,
        }
    }
}

impl IntervalClamp {
    /// Create a clamp, rejecting an empty or non-positive band
    pub fn new(min_secs: f64, max_secs: f64) -> Result<Self> {
        let clamp = Self { min_secs, max_secs };
        clamp.validate()?;
        Ok(clamp)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_secs.is_finite() && self.max_secs.is_finite()) {
            return Err(PidwattError::InvalidConfiguration(
                "interval bounds must be finite".to_string(),
            ));
        }
        if self.min_secs <= 0.0 {
            return Err(PidwattError::InvalidConfiguration(
                "interval_min_s must be > 0".to_string(),
            ));
        }
        if self.max_secs < self.min_secs {
            return Err(PidwattError::InvalidConfiguration(
                "interval_max_s must be >= interval_min_s".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a raw interval. Non-finite or non-positive input maps to `min`.
    pub fn clamp(&self, secs: f64) -> f64 {
        if !secs.is_finite() || secs <= 0.0 {
            return self.min_secs;
        }
        secs.clamp(self.min_secs, self.max_secs)
    }

    /// Clamp the time elapsed between two instants
    pub fn between(&self, earlier: Instant, later: Instant) -> f64 {
        let elapsed = later
            .checked_duration_since(earlier)
            .unwrap_or(Duration::ZERO);
        self.clamp(elapsed.as_secs_f64())
    }
}
