// src/engine/mod.rs
//! Mining session orchestration
//!
//! - [`MiningState`]: the session state machine and its allowed transitions
//! - [`SafetyMonitor`]: thermal and battery protection rules
//! - [`MiningEngine`]: composes the pool connection, the worker pool and the
//!   resource monitor, and exposes the command surface

/// Session state machine
pub mod state;

/// Thermal and battery protection
pub mod safety;

/// The [`MiningEngine`] coordinator
pub mod orchestrator;

pub use orchestrator::MiningEngine;
pub use safety::{SafetyEvent, SafetyLimits, SafetyMonitor};
pub use state::MiningState;
