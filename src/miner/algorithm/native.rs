// src/miner/algorithm/native.rs
//! Algorithms whose hashing needs an optimized native library.
//!
//! This build links no such library, so the backend reports itself as
//! unavailable and every digest call fails with
//! [`MinerError::UnsupportedAlgorithm`]. Callers treat that as zero
//! throughput rather than a fatal error.

use crate::miner::algorithm::Algorithm;
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;

/// Backend stand-in for an algorithm with no in-process implementation
#[derive(Debug, Clone, Copy)]
pub struct NativeOnly {
    algo: AlgorithmType,
}

impl NativeOnly {
    /// Creates the stand-in for `algo`
    pub fn new(algo: AlgorithmType) -> Self {
        Self { algo }
    }
}

impl Algorithm for NativeOnly {
    fn digest(&self, _input: &[u8]) -> Result<[u8; 32], MinerError> {
        Err(MinerError::UnsupportedAlgorithm(self.algo))
    }

    fn algorithm_type(&self) -> AlgorithmType {
        self.algo
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::block::Target;

    #[test]
    fn digest_and_verify_fail_without_panicking() {
        let rx = NativeOnly::new(AlgorithmType::RandomX);
        assert!(matches!(
            rx.digest(b"header"),
            Err(MinerError::UnsupportedAlgorithm(AlgorithmType::RandomX))
        ));
        assert!(rx.verify(b"header", &Target::from_bytes([0xff; 32])).is_err());
    }
}
