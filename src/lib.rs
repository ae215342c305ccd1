//! pidwatt: per-process energy attribution from RAPL counters
//!
//! The agent samples package energy counters, host CPU time and the CPU
//! time of one target process, then attributes a share of host power to
//! the target in proportion to its CPU use. The latest result is published
//! for an HTTP health/telemetry endpoint.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod resolver;
pub mod sampling;
pub mod sensors;
pub mod telemetry;

pub use agent::Agent;
pub use config::{AgentConfig, SamplingConfig};
pub use error::{PidwattError, Result};
pub use health::{HealthReport, HealthStatus};
pub use resolver::{ProcessIdentityResolver, ResolveError, ResolvedIdentity, ResolverOptions};
pub use sampling::{attribute, Attribution, LoopStats, Readers, SamplingLoop};
pub use telemetry::{PublishedState, Telemetry};
