// src/miner/mod.rs
//! Core mining functionality
//!
//! This module contains all components related to the mining process:
//! - Header construction, targets and hashing primitives
//! - Algorithm backends (SHA-256d, BLAKE3)
//! - Jobs, shares and the work board shared with the pool client
//! - Worker tasks and the resource controller that drives them

/// Mining algorithm implementations
///
/// Contains the [`Algorithm`] trait and one backend per supported
/// [`crate::types::AlgorithmType`].
pub mod algorithm;

/// Block header layout, merkle folding and target arithmetic
pub mod block;

/// Jobs, shares and the work board
pub mod job;

/// Worker pool control: nonce partitions, duty cycles, hashrate cap, holds
pub mod controller;

/// Worker task implementation
///
/// Contains the hashing loop that scans a nonce range and submits shares.
pub mod worker;

/// Offline hashing benchmark
pub mod benchmark;

// Re-export main components for cleaner imports
pub use self::algorithm::Algorithm;
pub use self::controller::{HoldReason, NonceRange, ResourceController};
pub use self::job::{Job, Share, ShareSink, WorkBoard, WorkState};
pub use self::worker::{Worker, WorkerContext};
