// src/stats/mod.rs
//! Statistics collection and reporting module
//!
//! This module provides functionality for tracking and reporting mining statistics,
//! including:
//! - Hashrate calculations
//! - Share acceptance/rejection tracking
//! - Hardware monitoring (CPU load, temperature, battery)
//!
//! The main component is [`StatsReporter`] which turns counters and sensor
//! readings into [`RunningStats`] snapshots and periodic log lines.

/// Submodule containing the statistics reporter implementation
pub mod reporter;

/// Device sensors (CPU, thermal zones, battery)
pub mod sensors;

// Re-export main components
pub use reporter::{HashCounter, RunningStats, StatsReporter};
pub use sensors::{BatteryStatus, DeviceSample, DeviceSensors, SystemSensors};
