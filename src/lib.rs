//! Mobile Miner - stratum mining client core for battery-powered devices
//!
//! This crate provides:
//! - A stratum v1 pool client with supervised reconnection
//! - Nonce-search workers over SHA-256d and BLAKE3 backends
//! - A resource controller for worker count, duty cycles and hashrate caps
//! - A mining engine that enforces thermal and battery protection
//! - Performance benchmarking

#![forbid(unsafe_code)]

/// Miner core: primitives, algorithms, jobs, workers and the resource controller
pub mod miner;

/// Pool protocol client and connection supervision
pub mod network;

/// Statistics collection and device sensors
pub mod stats;

/// Mining session state machine and orchestration
pub mod engine;

/// Utility functions and error handling
pub mod utils;

/// Command-line interface definitions
pub mod cli;

/// Configuration management
pub mod config;

/// Shared type definitions
pub mod types;

// Core exports
pub use cli::Commands;
pub use config::Config;
pub use engine::{MiningEngine, MiningState};
pub use miner::{Algorithm, Job, ResourceController, Share, WorkBoard, Worker};
pub use network::{ConnectionState, PoolConnection, StratumClient};
pub use stats::{DeviceSample, DeviceSensors, RunningStats, StatsReporter, SystemSensors};
pub use types::{AlgorithmType, EnergyMode};
pub use utils::{MinerError, init_logging};
