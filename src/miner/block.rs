// src/miner/block.rs
//! Hash and encoding primitives for block construction
//!
//! Everything in here is a pure function: hex conversion, endianness
//! helpers, coinbase assembly, merkle folding, header layout and the
//! compact-bits target. Header hashing itself goes through
//! [`crate::miner::algorithm`]; coinbase and merkle folding always use
//! SHA-256d.

use crate::utils::error::MinerError;
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of the version field in bytes
pub const VERSION_LEN: usize = 4;
/// Width of the previous-block hash in bytes
pub const PREV_HASH_LEN: usize = 32;
/// Width of the merkle root in bytes
pub const MERKLE_ROOT_LEN: usize = 32;
/// Width of the time field in bytes
pub const TIME_LEN: usize = 4;
/// Width of the compact difficulty bits in bytes
pub const BITS_LEN: usize = 4;
/// Width of the nonce in bytes
pub const NONCE_LEN: usize = 4;
/// Total serialized header length
pub const HEADER_LEN: usize =
    VERSION_LEN + PREV_HASH_LEN + MERKLE_ROOT_LEN + TIME_LEN + BITS_LEN + NONCE_LEN;
/// Offset of the nonce inside a serialized header
pub const NONCE_OFFSET: usize = HEADER_LEN - NONCE_LEN;

/// Compact bits of the difficulty-1 target
pub const DIFF1_BITS: u32 = 0x1d00ffff;

/// Single SHA-256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 of SHA-256
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Decodes hex into bytes; accepts upper and lower case
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, MinerError> {
    Ok(hex::decode(hex_str.trim())?)
}

/// Encodes bytes as lowercase hex
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Full byte reversal (big <-> little endian)
pub fn reverse_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Reverses each `group`-sized chunk in place order, e.g. the 32-bit word
/// swaps some pools expect for the previous-block hash.
///
/// A trailing chunk shorter than `group` is reversed on its own.
pub fn reverse_bytes_in_groups(bytes: &[u8], group: usize) -> Vec<u8> {
    if group <= 1 {
        return bytes.to_vec();
    }
    bytes
        .chunks(group)
        .flat_map(|chunk| chunk.iter().rev().copied())
        .collect()
}

/// Assembles the coinbase: `coinbase1 ++ extranonce1 ++ extranonce2 ++ coinbase2`
pub fn build_coinbase(
    coinbase1: &[u8],
    extranonce1: &[u8],
    extranonce2: &[u8],
    coinbase2: &[u8],
) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(coinbase1.len() + extranonce1.len() + extranonce2.len() + coinbase2.len());
    out.extend_from_slice(coinbase1);
    out.extend_from_slice(extranonce1);
    out.extend_from_slice(extranonce2);
    out.extend_from_slice(coinbase2);
    out
}

/// Folds the coinbase hash with each branch, left to right
///
/// `root = sha256d(coinbase)`, then `root = sha256d(root ++ branch)` for
/// every branch in order. Order matters; branches do not commute.
pub fn merkle_root<B: AsRef<[u8]>>(coinbase: &[u8], branches: &[B]) -> [u8; 32] {
    let mut root = sha256d(coinbase);
    let mut buf = [0u8; 64];
    for branch in branches {
        let branch = branch.as_ref();
        if branch.len() == 32 {
            buf[..32].copy_from_slice(&root);
            buf[32..].copy_from_slice(branch);
            root = sha256d(&buf);
        } else {
            let mut joined = root.to_vec();
            joined.extend_from_slice(branch);
            root = sha256d(&joined);
        }
    }
    root
}

fn decode_field(name: &str, hex_str: &str, width: usize) -> Result<Vec<u8>, MinerError> {
    let bytes = hex_to_bytes(hex_str)?;
    if bytes.len() != width {
        return Err(MinerError::InputError(format!(
            "{} must be {} bytes, got {}",
            name,
            width,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Serializes a block header from its hex-encoded fields
///
/// Fields are decoded and concatenated in the fixed order
/// version, prev-hash, merkle root, time, bits, nonce. Each must decode
/// to its exact width.
pub fn build_header(
    version: &str,
    prev_hash: &str,
    merkle_root: &str,
    time: &str,
    bits: &str,
    nonce: &str,
) -> Result<Vec<u8>, MinerError> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend(decode_field("version", version, VERSION_LEN)?);
    header.extend(decode_field("prev_hash", prev_hash, PREV_HASH_LEN)?);
    header.extend(decode_field("merkle_root", merkle_root, MERKLE_ROOT_LEN)?);
    header.extend(decode_field("time", time, TIME_LEN)?);
    header.extend(decode_field("bits", bits, BITS_LEN)?);
    header.extend(decode_field("nonce", nonce, NONCE_LEN)?);
    Ok(header)
}

/// Wire form of a nonce: eight lowercase hex digits
pub fn nonce_hex(nonce: u32) -> String {
    format!("{:08x}", nonce)
}

/// Writes `nonce` into a serialized header
pub fn set_header_nonce(header: &mut [u8; HEADER_LEN], nonce: u32) {
    header[NONCE_OFFSET..].copy_from_slice(&nonce.to_be_bytes());
}

/// Hash-acceptance bound, 32 bytes ordered most significant first
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// A target no hash except all-zero can meet
    pub const ZERO: Target = Target([0u8; 32]);

    /// Wraps raw target bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Target(bytes)
    }

    /// Decodes compact bits: high byte is the exponent, low 24 bits the
    /// mantissa
    ///
    /// The three mantissa bytes land at offset `29 - exponent`. Offsets
    /// outside `0..29` yield [`Target::ZERO`], which nothing satisfies.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as i64;
        let mantissa = bits & 0x00ff_ffff;
        let offset = 29 - exponent;

        let mut target = [0u8; 32];
        if (0..29).contains(&offset) {
            let offset = offset as usize;
            target[offset..offset + 3].copy_from_slice(&mantissa.to_be_bytes()[1..]);
        }
        Target(target)
    }

    /// Parses the job's hex-encoded bits field and decodes it
    pub fn from_bits_hex(bits: &str) -> Result<Self, MinerError> {
        let raw = u32::from_str_radix(bits.trim(), 16)
            .map_err(|e| MinerError::InputError(format!("Invalid bits '{}': {}", bits, e)))?;
        Ok(Self::from_compact(raw))
    }

    /// Share target for a pool difficulty: difficulty-1 target / `difficulty`
    ///
    /// Precision is that of an `f64` mantissa, which is all a pool-issued
    /// share difficulty carries anyway.
    pub fn from_difficulty(difficulty: f64) -> Result<Self, MinerError> {
        if !difficulty.is_finite() || difficulty <= 0.0 {
            return Err(MinerError::InputError(format!(
                "Difficulty must be positive, got {}",
                difficulty
            )));
        }
        let diff1 = Target::from_compact(DIFF1_BITS).to_f64();
        Ok(Target::from_f64(diff1 / difficulty))
    }

    fn to_f64(self) -> f64 {
        self.0.iter().fold(0.0, |acc, &b| acc * 256.0 + b as f64)
    }

    fn from_f64(mut value: f64) -> Self {
        let mut out = [0u8; 32];
        if value >= 256f64.powi(32) {
            return Target([0xff; 32]);
        }
        for (i, byte) in out.iter_mut().enumerate() {
            let place = 256f64.powi(31 - i as i32);
            let digit = (value / place).floor().clamp(0.0, 255.0);
            *byte = digit as u8;
            value = (value - digit * place).max(0.0);
        }
        Target(out)
    }

    /// Raw bytes, most significant first
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True when `hash` is numerically at or below this target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        meets_target(hash, &self.0)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", bytes_to_hex(&self.0))
    }
}

/// Compares two 32-byte big-endian magnitudes; `hash <= target` meets
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for (h, t) in hash.iter().zip(target.iter()) {
        if h < t {
            return true;
        }
        if h > t {
            return false;
        }
    }
    true
}
