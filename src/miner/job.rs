// src/miner/job.rs
//! Work units exchanged between the pool client and the workers
//!
//! The pool client is the only writer of the [`WorkBoard`]; workers read
//! consistent [`WorkState`] snapshots (job and target together) from it and
//! hand found [`Share`]s to a [`ShareSink`].

use crate::miner::block::{self, HEADER_LEN, Target};
use crate::utils::error::MinerError;
use arc_swap::ArcSwapOption;
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// A unit of work announced by `mining.notify`
///
/// Fields keep their wire (hex) form; [`Job::validate`] checks that each
/// one decodes to the width the header layout expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Pool-assigned job identifier
    pub job_id: String,
    /// Previous block hash (32 bytes)
    pub prev_hash: String,
    /// Coinbase bytes before the extranonces
    pub coinbase1: String,
    /// Coinbase bytes after the extranonces
    pub coinbase2: String,
    /// Merkle branch hashes, folded in order
    pub merkle_branch: Vec<String>,
    /// Block version (4 bytes)
    pub version: String,
    /// Compact difficulty bits (4 bytes)
    pub bits: String,
    /// Block time (4 bytes)
    pub time: String,
    /// Whether work on earlier jobs must be abandoned
    pub clean_jobs: bool,
}

impl Job {
    /// Checks every field decodes and has the expected width
    pub fn validate(&self) -> Result<(), MinerError> {
        fn width(name: &str, value: &str, expected: usize) -> Result<(), MinerError> {
            let len = block::hex_to_bytes(value)?.len();
            if len != expected {
                return Err(MinerError::ProtocolError(format!(
                    "{} is {} bytes, expected {}",
                    name, len, expected
                )));
            }
            Ok(())
        }

        if self.job_id.is_empty() {
            return Err(MinerError::ProtocolError("empty job id".into()));
        }
        width("prev_hash", &self.prev_hash, block::PREV_HASH_LEN)?;
        width("version", &self.version, block::VERSION_LEN)?;
        width("bits", &self.bits, block::BITS_LEN)?;
        width("time", &self.time, block::TIME_LEN)?;
        block::hex_to_bytes(&self.coinbase1)?;
        block::hex_to_bytes(&self.coinbase2)?;
        for branch in &self.merkle_branch {
            width("merkle branch", branch, 32)?;
        }
        Ok(())
    }

    /// Target encoded in the job's own bits field
    pub fn bits_target(&self) -> Result<Target, MinerError> {
        Target::from_bits_hex(&self.bits)
    }

    /// Builds the 80-byte header for one extranonce pair, nonce zeroed
    pub fn header_template(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
    ) -> Result<[u8; HEADER_LEN], MinerError> {
        let coinbase = block::build_coinbase(
            &block::hex_to_bytes(&self.coinbase1)?,
            extranonce1,
            extranonce2,
            &block::hex_to_bytes(&self.coinbase2)?,
        );
        let branches = self
            .merkle_branch
            .iter()
            .map(|b| block::hex_to_bytes(b))
            .collect::<Result<Vec<_>, _>>()?;
        let root = block::merkle_root(&coinbase, &branches);

        let header = block::build_header(
            &self.version,
            &self.prev_hash,
            &block::bytes_to_hex(&root),
            &self.time,
            &self.bits,
            &block::nonce_hex(0),
        )?;
        header
            .try_into()
            .map_err(|_| MinerError::ProtocolError("header has wrong length".into()))
    }
}

/// A solution found by a worker, submitted exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Job the share was found on
    pub job_id: String,
    /// Worker-chosen extranonce2, hex encoded
    pub extranonce2: String,
    /// Time field the header was built with
    pub time: String,
    /// Winning nonce
    pub nonce: u32,
    /// Clean-job epoch the share was found in
    pub clean_epoch: u64,
}

impl Share {
    /// Wire form of the nonce
    pub fn nonce_hex(&self) -> String {
        block::nonce_hex(self.nonce)
    }
}

/// Destination for found shares
///
/// Submission never blocks the caller; acceptance is reported later by
/// the pool.
pub trait ShareSink: Send + Sync {
    /// Queue `share` for submission
    fn submit(&self, share: Share) -> Result<(), MinerError>;
}

/// Everything a worker needs to build headers, read as one unit
#[derive(Debug, Clone)]
pub struct WorkState {
    /// Current job
    pub job: Arc<Job>,
    /// Share target in force for this job
    pub target: Target,
    /// Session extranonce1 from the subscribe response
    pub extranonce1: Vec<u8>,
    /// Extranonce2 width from the subscribe response
    pub extranonce2_size: usize,
    /// Clean-job epoch this state belongs to
    pub clean_epoch: u64,
}

/// Single-writer, many-reader cell holding the current [`WorkState`]
///
/// The clean epoch is bumped *before* the successor state is stored, so a
/// reader that sees the new job also sees the new epoch.
#[derive(Debug)]
pub struct WorkBoard {
    current: ArcSwapOption<WorkState>,
    clean_epoch: AtomicU64,
    version: watch::Sender<u64>,
}

impl Default for WorkBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkBoard {
    /// Creates an empty board
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        WorkBoard {
            current: ArcSwapOption::const_empty(),
            clean_epoch: AtomicU64::new(0),
            version,
        }
    }

    /// Latest published work, if any
    pub fn snapshot(&self) -> Option<Arc<WorkState>> {
        self.current.load_full()
    }

    /// Current clean-job epoch
    pub fn clean_epoch(&self) -> u64 {
        self.clean_epoch.load(Ordering::Acquire)
    }

    /// Starts a new clean epoch and returns it
    pub fn begin_clean_epoch(&self) -> u64 {
        self.clean_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replaces the current work
    pub fn publish(&self, state: WorkState) {
        self.current.store(Some(Arc::new(state)));
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Withdraws all work, e.g. when the session ends
    pub fn clear(&self) {
        self.begin_clean_epoch();
        self.current.store(None);
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Receiver notified on every publish or clear
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Random extranonce2 of the pool-mandated width
pub fn generate_extranonce2(size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}
