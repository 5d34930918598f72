// src/miner/benchmark.rs
//! Offline hashing benchmark
//!
//! Hashes a synthetic header on a dedicated rayon pool, one nonce range
//! per thread, and reports the aggregate rate.

use crate::miner::algorithm::{self, Algorithm};
use crate::miner::block::{self, HEADER_LEN};
use crate::miner::controller::{NonceRange, partition_nonces};
use crate::miner::worker::HASHES_PER_BLOCK;
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Result of a benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub algorithm: AlgorithmType,
    pub threads: usize,
    pub hashes: u64,
    pub elapsed: Duration,
}

impl BenchmarkReport {
    /// Average hashes per second over the whole run
    pub fn hashrate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.hashes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Runs `algo` on `threads` threads for about `duration`
///
/// # Errors
/// `InputError` for zero threads, `UnsupportedAlgorithm` when the build has
/// no backend for `algo`.
pub fn run(algo: AlgorithmType, duration: Duration, threads: usize) -> Result<BenchmarkReport, MinerError> {
    if threads == 0 {
        return Err(MinerError::InputError("benchmark needs at least one thread".into()));
    }
    let algorithm = algorithm::create(algo);
    if !algorithm.is_available() {
        return Err(MinerError::UnsupportedAlgorithm(algo));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("bench-{}", i))
        .build()
        .map_err(|e| MinerError::TaskError(format!("cannot build thread pool: {}", e)))?;

    let ranges = partition_nonces(threads);
    let started = Instant::now();
    let hashes = pool.install(|| {
        ranges
            .par_iter()
            .enumerate()
            .map(|(thread, range)| hash_range(algorithm.as_ref(), thread, *range, started, duration))
            .try_reduce(|| 0, |a, b| Ok(a + b))
    })?;

    Ok(BenchmarkReport {
        algorithm: algo,
        threads,
        hashes,
        elapsed: started.elapsed(),
    })
}

fn hash_range(
    algorithm: &dyn Algorithm,
    thread: usize,
    range: NonceRange,
    started: Instant,
    duration: Duration,
) -> Result<u64, MinerError> {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&[0x20, 0, 0, 0]);

    let mut nonce = range.start;
    let mut total = 0u64;
    let mut since_log = 0u64;
    let mut last_log = Instant::now();

    while started.elapsed() < duration && nonce < range.end {
        let end = (nonce + HASHES_PER_BLOCK).min(range.end);
        for n in nonce..end {
            block::set_header_nonce(&mut header, n as u32);
            algorithm.digest(&header)?;
        }
        since_log += end - nonce;
        total += end - nonce;
        nonce = end;

        if last_log.elapsed() >= Duration::from_secs(1) {
            log::debug!(
                "Thread {}: {:.1} H/s",
                thread,
                since_log as f64 / last_log.elapsed().as_secs_f64()
            );
            since_log = 0;
            last_log = Instant::now();
        }
    }
    Ok(total)
}
