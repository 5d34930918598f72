// src/config/config.rs
use crate::miner::controller::MAX_WORKERS;
use crate::network::{ConnectionSettings, Credentials, PoolEndpoint, ReconnectPolicy};
use crate::types::{AlgorithmType, EnergyMode};
use crate::utils::error::MinerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the mining application
///
/// Contains all settings needed to run a mining session: algorithm
/// selection, pool login, resource limits and connection timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Mining algorithm to use (e.g., "sha256d", "blake3")
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmType,

    /// Optional preset applied on top of `[resources]`
    #[serde(default)]
    pub energy_mode: Option<EnergyMode>,

    /// Pool login
    pub pool: PoolConfig,

    /// Worker and safety limits
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Reconnection and timeout settings
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Stratum pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool URL (e.g., "stratum+tcp://pool.example.com:3333")
    pub url: String,
    /// Wallet address or pool account
    pub wallet: String,
    /// Worker name appended to the wallet as `wallet.worker`
    #[serde(default = "default_worker")]
    pub worker: String,
    /// Worker password (often "x" if not required)
    #[serde(default = "default_password")]
    pub password: String,
}

impl PoolConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.wallet, &self.worker, &self.password)
    }
}

/// Worker pool and device safety settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Number of hashing workers
    pub worker_count: usize,
    /// Per-worker duty cycle in percent
    pub duty_cycle: u8,
    /// Aggregate hashrate cap in H/s
    pub hashrate_limit: Option<f64>,
    /// Pause when the CPU gets hotter than this (Celsius)
    pub max_temperature: f32,
    pub thermal_protection: bool,
    /// Time to stay throttled after overheating
    pub thermal_cooldown_ms: u64,
    pub battery_protection: bool,
    /// Pause below this charge (percent) unless charging
    pub low_battery_threshold: u8,
    /// Charge above the threshold needed to resume
    pub battery_hysteresis: u8,
    /// Pause when the battery gets hotter than this (Celsius)
    pub battery_max_temperature: f32,
    /// Sensor polling period
    pub monitor_interval_ms: u64,
    /// How often the stats line is logged
    pub report_interval_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            worker_count: EnergyMode::Balanced.workers(num_cpus::get()),
            duty_cycle: 100,
            hashrate_limit: None,
            max_temperature: 80.0,
            thermal_protection: true,
            thermal_cooldown_ms: 30_000,
            battery_protection: true,
            low_battery_threshold: 20,
            battery_hysteresis: 10,
            battery_max_temperature: 45.0,
            monitor_interval_ms: 2_000,
            report_interval_secs: 60,
        }
    }
}

/// Connection supervision settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_reconnect_attempts: u32,
    /// Attempt `n` waits `n` times this long
    pub reconnect_base_delay_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Bound on TCP connect plus subscribe reply
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 5_000,
            watchdog_interval_ms: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            policy: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                max_attempts: self.max_reconnect_attempts,
            },
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

fn default_algorithm() -> AlgorithmType {
    AlgorithmType::Sha256d
}

fn default_worker() -> String {
    "mobile".into()
}

fn default_password() -> String {
    "x".into()
}

impl Config {
    /// Minimal configuration for `url` and `wallet`, defaults elsewhere
    pub fn new(url: impl Into<String>, wallet: impl Into<String>) -> Self {
        Config {
            algorithm: default_algorithm(),
            energy_mode: None,
            pool: PoolConfig {
                url: url.into(),
                wallet: wallet.into(),
                worker: default_worker(),
                password: default_password(),
            },
            resources: ResourceConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    /// Loads configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Ok(Config)` - Successfully loaded configuration
    /// * `Err(MinerError)` - If file couldn't be read or parsed
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MinerError> {
        let path = path.into();
        let config_str = std::fs::read_to_string(&path).map_err(|e| {
            MinerError::ConfigError(format!(
                "Failed to read config at {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&config_str)
            .map_err(|e| MinerError::ConfigError(format!("Invalid config format: {}", e)))
    }

    /// Applies an energy preset for a device with `cores` logical CPUs
    pub fn apply_energy_mode(&mut self, mode: EnergyMode, cores: usize) {
        self.energy_mode = Some(mode);
        self.resources.worker_count = mode.workers(cores);
        self.resources.duty_cycle = mode.duty_cycle();
        self.resources.max_temperature = mode.max_temperature();
    }

    /// Rejects settings a session could not run with
    pub fn validate(&self) -> Result<(), MinerError> {
        PoolEndpoint::parse(&self.pool.url)?;
        if self.pool.wallet.trim().is_empty() {
            return Err(MinerError::ConfigError("pool wallet must not be empty".into()));
        }

        let r = &self.resources;
        if r.worker_count == 0 || r.worker_count > MAX_WORKERS {
            return Err(MinerError::ConfigError(format!(
                "worker_count must be between 1 and {}, got {}",
                MAX_WORKERS, r.worker_count
            )));
        }
        if !(1..=100).contains(&r.duty_cycle) {
            return Err(MinerError::ConfigError(format!(
                "duty_cycle must be between 1 and 100, got {}",
                r.duty_cycle
            )));
        }
        if let Some(limit) = r.hashrate_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(MinerError::ConfigError(format!(
                    "hashrate_limit must be positive, got {}",
                    limit
                )));
            }
        }
        if r.low_battery_threshold > 100 {
            return Err(MinerError::ConfigError(
                "low_battery_threshold is a percentage".into(),
            ));
        }
        if r.monitor_interval_ms == 0 || r.report_interval_secs == 0 {
            return Err(MinerError::ConfigError(
                "monitor and report intervals must be non-zero".into(),
            ));
        }

        let c = &self.connection;
        if c.watchdog_interval_ms == 0 || c.handshake_timeout_ms == 0 {
            return Err(MinerError::ConfigError(
                "watchdog and handshake timings must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Generates a configuration template string
    ///
    /// # Returns
    /// String containing a commented TOML configuration template
    pub fn generate_template() -> String {
        let mut template = String::new();
        template.push_str("# Mobile Miner Configuration\n\n");
        template.push_str("# Supported algorithms: sha256d, blake3 (scrypt, randomx need a native backend)\n");
        template.push_str("algorithm = \"sha256d\"\n");
        template.push_str("# Optional preset: eco, balanced, performance\n");
        template.push_str("# energy_mode = \"balanced\"\n\n");

        template.push_str("[pool]\n");
        template.push_str("url = \"stratum+tcp://pool.example.com:3333\"\n");
        template.push_str("wallet = \"your_wallet_address\"\n");
        template.push_str("worker = \"mobile\"\n");
        template.push_str("password = \"x\"\n\n");

        template.push_str("[resources]\n");
        template.push_str("worker_count = 2\n");
        template.push_str("# Percent of each cycle spent hashing (1-100)\n");
        template.push_str("duty_cycle = 100\n");
        template.push_str("# hashrate_limit = 50000.0\n");
        template.push_str("max_temperature = 80.0\n");
        template.push_str("thermal_protection = true\n");
        template.push_str("thermal_cooldown_ms = 30000\n");
        template.push_str("battery_protection = true\n");
        template.push_str("low_battery_threshold = 20\n");
        template.push_str("battery_hysteresis = 10\n");
        template.push_str("battery_max_temperature = 45.0\n");
        template.push_str("monitor_interval_ms = 2000\n");
        template.push_str("report_interval_secs = 60\n\n");

        template.push_str("[connection]\n");
        template.push_str("max_reconnect_attempts = 5\n");
        template.push_str("reconnect_base_delay_ms = 5000\n");
        template.push_str("watchdog_interval_ms = 10000\n");
        template.push_str("handshake_timeout_ms = 10000\n");

        template
    }
}
