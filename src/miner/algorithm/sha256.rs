// src/miner/algorithm/sha256.rs
//! Double SHA-256 over the 80-byte header, as used by Bitcoin-style pools.

use crate::miner::algorithm::Algorithm;
use crate::miner::block;
use crate::types::AlgorithmType;
use crate::utils::error::MinerError;

/// SHA-256d backend built on the `sha2` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl Algorithm for Sha256d {
    fn digest(&self, input: &[u8]) -> Result<[u8; 32], MinerError> {
        Ok(block::sha256d(input))
    }

    fn algorithm_type(&self) -> AlgorithmType {
        AlgorithmType::Sha256d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn genesis_header_hashes_to_genesis_block_id() {
        // Bitcoin genesis header; the block id is this digest reversed.
        let header = hex!(
            "0100000000000000000000000000000000000000000000000000000000000000"
            "000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa"
            "4b1e5e4a29ab5f49ffff001d1dac2b7c"
        );
        let mut id = Sha256d.digest(&header).unwrap();
        id.reverse();
        assert_eq!(
            id,
            hex!("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
        );
    }
}
