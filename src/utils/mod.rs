// src/utils/mod.rs
//! Utilities shared across the mining client: error handling and logging.

/// Error types and conversions
///
/// Contains the [`MinerError`] enum returned by every fallible operation
/// in the crate.
pub mod error;

/// Logging configuration built on `env_logger`
pub mod logging;

pub use error::MinerError;
pub use logging::{init_bench_logging, init_logging};
