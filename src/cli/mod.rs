// src/cli/mod.rs
//! Command-line interface built with `clap` derive

/// Argument definitions for the `mobile-miner` binary
pub mod commands;

pub use commands::{Action, BenchmarkOptions, Commands, ConfigOptions, StartOptions};
