// src/stats/reporter.rs
use crate::network::ShareCounters;
use crate::stats::sensors::DeviceSample;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Power drawn by the CPU at full load on a typical phone SoC, in watts
pub const FULL_LOAD_WATTS: f64 = 3.5;

/// Rough power estimate for a CPU usage percentage
pub fn estimate_power(cpu_usage: f32) -> f64 {
    f64::from(cpu_usage.clamp(0.0, 100.0)) / 100.0 * FULL_LOAD_WATTS
}

/// Hash total shared by all workers of a session
#[derive(Debug, Default)]
pub struct HashCounter {
    total: AtomicU64,
}

impl HashCounter {
    pub fn add(&self, hashes: u64) {
        self.total.fetch_add(hashes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of a running session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    /// Hashes per second since the previous sample
    pub hashrate: f64,
    /// Total number of hashes computed this session
    pub total_hashes: u64,
    /// Pool share counters
    pub shares: ShareCounters,
    /// Running worker tasks
    pub workers: usize,
    /// CPU temperature in Celsius
    pub temperature: Option<f32>,
    /// Current CPU usage percentage (0-100)
    pub cpu_usage: f32,
    /// Battery charge in percent
    pub battery_level: Option<u8>,
    /// Estimated CPU power draw in watts
    pub power_estimate: f64,
    /// Time since the session started
    pub uptime: Duration,
}

struct RateWindow {
    started: Instant,
    at: Instant,
    hashes: u64,
    last_report: Instant,
    report_interval: Duration,
}

/// Collects and reports mining and hardware statistics
///
/// Workers feed the shared [`HashCounter`]; the engine's monitor calls
/// [`sample`](Self::sample) every tick, which publishes a [`RunningStats`]
/// on a watch channel and logs a summary line every `report_interval`.
pub struct StatsReporter {
    hashes: Arc<HashCounter>,
    window: Mutex<RateWindow>,
    latest: watch::Sender<RunningStats>,
}

impl StatsReporter {
    /// Creates a new StatsReporter with the specified reporting interval
    ///
    /// # Arguments
    /// * `report_interval` - How often to log statistics
    pub fn new(report_interval: Duration) -> Self {
        let now = Instant::now();
        let (latest, _) = watch::channel(RunningStats::default());
        StatsReporter {
            hashes: Arc::new(HashCounter::default()),
            window: Mutex::new(RateWindow {
                started: now,
                at: now,
                hashes: 0,
                last_report: now,
                report_interval,
            }),
            latest,
        }
    }

    /// Counter the workers add to
    pub fn hash_counter(&self) -> Arc<HashCounter> {
        self.hashes.clone()
    }

    /// Changes how often the summary line is logged
    pub fn set_report_interval(&self, report_interval: Duration) {
        self.window.lock().report_interval = report_interval;
    }

    /// Starts a fresh session: zeroes counters and uptime
    pub fn reset(&self) {
        self.hashes.reset();
        let now = Instant::now();
        let mut window = self.window.lock();
        window.started = now;
        window.at = now;
        window.hashes = 0;
        window.last_report = now;
        drop(window);
        self.latest.send_replace(RunningStats::default());
    }

    /// Builds, publishes and returns the current statistics
    ///
    /// # Arguments
    /// * `shares` - Counters from the pool client
    /// * `device` - Latest sensor reading
    /// * `workers` - Number of running workers
    pub fn sample(&self, shares: ShareCounters, device: &DeviceSample, workers: usize) -> RunningStats {
        let total = self.hashes.total();
        let now = Instant::now();

        let (hashrate, uptime, due) = {
            let mut window = self.window.lock();
            let elapsed = now.duration_since(window.at).as_secs_f64();
            let hashrate = if elapsed > 0.0 {
                total.saturating_sub(window.hashes) as f64 / elapsed
            } else {
                0.0
            };
            window.at = now;
            window.hashes = total;

            let due = now.duration_since(window.last_report) >= window.report_interval;
            if due {
                window.last_report = now;
            }
            (hashrate, now.duration_since(window.started), due)
        };

        let stats = RunningStats {
            hashrate,
            total_hashes: total,
            shares,
            workers,
            temperature: device.temperature,
            cpu_usage: device.cpu_usage,
            battery_level: device.battery.map(|b| b.level),
            power_estimate: estimate_power(device.cpu_usage),
            uptime,
        };
        if due {
            log_stats(&stats);
        }
        self.latest.send_replace(stats.clone());
        stats
    }

    /// Last published statistics
    pub fn latest(&self) -> RunningStats {
        self.latest.borrow().clone()
    }

    /// Receiver notified on every sample
    pub fn subscribe(&self) -> watch::Receiver<RunningStats> {
        self.latest.subscribe()
    }
}

/// Logs the one-line session summary
pub fn log_stats(stats: &RunningStats) {
    log::info!(
        "Hashrate: {:.2} H/s | Accepted/Rejected: {}/{} | CPU: {:.1}% | Temp: {} | Battery: {} | Power: {:.2} W",
        stats.hashrate,
        stats.shares.accepted,
        stats.shares.rejected,
        stats.cpu_usage,
        stats
            .temperature
            .map_or_else(|| "n/a".to_string(), |t| format!("{:.1}°C", t)),
        stats
            .battery_level
            .map_or_else(|| "n/a".to_string(), |b| format!("{}%", b)),
        stats.power_estimate
    );
}
