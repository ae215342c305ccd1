//! Shared building blocks: defaults and interval handling

pub mod constants;
pub mod interval;

pub use interval::IntervalClamp;
