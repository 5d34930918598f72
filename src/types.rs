// src/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proof-of-work algorithms the client knows how to dispatch
///
/// The set is closed: every variant maps to exactly one hashing backend
/// in [`crate::miner::algorithm`]. Variants without an in-process backend
/// still parse so that configurations stay portable between builds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmType {
    /// Double SHA-256 (Bitcoin and derivatives)
    #[clap(name = "sha256d")]
    Sha256d,

    /// BLAKE3 over the block header
    #[clap(name = "blake3")]
    Blake3,

    /// Scrypt (Litecoin parameters); needs a native backend
    #[clap(name = "scrypt")]
    Scrypt,

    /// RandomX light mode; needs a native backend
    #[clap(name = "randomx")]
    RandomX,
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmType::Sha256d => write!(f, "sha256d"),
            AlgorithmType::Blake3 => write!(f, "blake3"),
            AlgorithmType::Scrypt => write!(f, "scrypt"),
            AlgorithmType::RandomX => write!(f, "randomx"),
        }
    }
}

impl FromStr for AlgorithmType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha256d" => Ok(AlgorithmType::Sha256d),
            "blake3" => Ok(AlgorithmType::Blake3),
            "scrypt" => Ok(AlgorithmType::Scrypt),
            "randomx" | "rx" => Ok(AlgorithmType::RandomX),
            _ => Err(format!("Unknown algorithm: {}", s)),
        }
    }
}

/// Resource presets trading hashrate against heat and battery drain
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyMode {
    /// A quarter of the cores at half duty, low thermal ceiling
    Eco,
    /// Half the cores at 70% duty
    Balanced,
    /// Every core at 90% duty, highest thermal ceiling
    Performance,
}

impl EnergyMode {
    /// Worker count for a device with `cores` logical CPUs (never zero)
    pub fn workers(self, cores: usize) -> usize {
        let n = match self {
            EnergyMode::Eco => cores / 4,
            EnergyMode::Balanced => cores / 2,
            EnergyMode::Performance => cores,
        };
        n.max(1)
    }

    /// Per-worker duty cycle in percent
    pub fn duty_cycle(self) -> u8 {
        match self {
            EnergyMode::Eco => 50,
            EnergyMode::Balanced => 70,
            EnergyMode::Performance => 90,
        }
    }

    /// Thermal ceiling in degrees Celsius
    pub fn max_temperature(self) -> f32 {
        match self {
            EnergyMode::Eco => 70.0,
            EnergyMode::Balanced => 80.0,
            EnergyMode::Performance => 85.0,
        }
    }
}

impl fmt::Display for EnergyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyMode::Eco => write!(f, "eco"),
            EnergyMode::Balanced => write!(f, "balanced"),
            EnergyMode::Performance => write!(f, "performance"),
        }
    }
}
