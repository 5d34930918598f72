// src/utils/logging.rs
//! Logging configuration
//!
//! Two profiles are provided:
//! - mining sessions log at `Info` so the periodic stats line and state
//!   transitions stay readable on a phone console
//! - benchmarks log at `Debug` to show per-thread progress
//!
//! Both respect `RUST_LOG` when it is set. Uses `env_logger` under the hood.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;

/// Which kind of run the logger is being set up for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProfile {
    /// A pool mining session
    Mining,
    /// A local hashing benchmark
    Benchmark,
}

impl LogProfile {
    fn default_level(self) -> LevelFilter {
        match self {
            LogProfile::Mining => LevelFilter::Info,
            LogProfile::Benchmark => LevelFilter::Debug,
        }
    }
}

/// Initializes logging for a mining session
pub fn init_logging() {
    init_with_profile(LogProfile::Mining);
}

/// Initializes logging for a benchmark run
pub fn init_bench_logging() {
    init_with_profile(LogProfile::Benchmark);
}

/// Initializes the global logger for the given profile
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_with_profile(profile: LogProfile) {
    let mut builder = common_log_config();

    match env::var("RUST_LOG") {
        Ok(spec) => {
            builder.parse_filters(&spec);
        }
        Err(_) => {
            builder
                .filter_level(profile.default_level())
                // sysinfo is chatty at debug on some kernels
                .filter_module("sysinfo", LevelFilter::Warn);
        }
    }

    let _ = builder.try_init();
}

/// Base builder shared by all profiles
///
/// Format: `[<ts> <LEVEL> <module>:<line>] message`, written to stdout.
fn common_log_config() -> Builder {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            use std::io::Write;
            let ts = buf.timestamp_seconds();
            let level = record.level();
            let module = record.module_path().unwrap_or_default();
            let line = record.line().unwrap_or(0);

            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                ts,
                level,
                module,
                line,
                record.args()
            )
        })
        .target(Target::Stdout);

    builder
}
