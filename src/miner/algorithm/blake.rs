// src/miner/algorithm/blake.rs
use crate::miner::algorithm::Algorithm;
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;

/// BLAKE3 backend
///
/// Single-pass BLAKE3 of the header; the digest is compared against the
/// target as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Algo;

impl Algorithm for Blake3Algo {
    fn digest(&self, input: &[u8]) -> Result<[u8; 32], MinerError> {
        Ok(*::blake3::hash(input).as_bytes())
    }

    fn algorithm_type(&self) -> AlgorithmType {
        AlgorithmType::Blake3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn empty_input_matches_reference_digest() {
        assert_eq!(
            Blake3Algo.digest(&[]).unwrap(),
            hex!("af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262")
        );
    }
}
