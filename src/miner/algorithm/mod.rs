// src/miner/algorithm/mod.rs
//! Hashing backends
//!
//! Each supported [`AlgorithmType`] maps to exactly one backend behind the
//! [`Algorithm`] trait. Backends that need native code this build does not
//! ship are represented by [`native::NativeOnly`], which reports itself as
//! unavailable so workers can idle instead of crashing.

/// Double SHA-256 backend
pub mod sha256;

/// BLAKE3 backend
pub mod blake;

/// Placeholder for algorithms that need a native library
pub mod native;

use crate::miner::block::Target;
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;
use std::sync::Arc;

/// Common interface for all hashing backends
///
/// Implementations must be cheap to call from many worker tasks at once.
pub trait Algorithm: Send + Sync {
    /// Hash a serialized block header
    ///
    /// # Returns
    /// 32-byte digest ordered so it can be compared against a [`Target`]
    fn digest(&self, input: &[u8]) -> Result<[u8; 32], MinerError>;

    /// Check whether `header` hashes at or below `target`
    fn verify(&self, header: &[u8], target: &Target) -> Result<bool, MinerError> {
        let hash = self.digest(header)?;
        Ok(target.is_met_by(&hash))
    }

    /// The algorithm this backend implements
    fn algorithm_type(&self) -> AlgorithmType;

    /// Whether `digest` can actually produce hashes in this build
    fn is_available(&self) -> bool {
        true
    }
}

/// Resolves the backend for `algo`
///
/// Never fails: algorithms without a backend resolve to one whose
/// [`Algorithm::is_available`] is false.
pub fn create(algo: AlgorithmType) -> Arc<dyn Algorithm> {
    match algo {
        AlgorithmType::Sha256d => Arc::new(sha256::Sha256d),
        AlgorithmType::Blake3 => Arc::new(blake::Blake3Algo),
        AlgorithmType::Scrypt | AlgorithmType::RandomX => Arc::new(native::NativeOnly::new(algo)),
    }
}
