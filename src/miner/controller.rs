// src/miner/controller.rs
//! Resource controller
//!
//! Owns the worker tasks and the control table they read between hash
//! blocks: nonce partitions, per-worker duty cycles, the hashrate-cap delay
//! and the pause holds. Writers are serialized by one mutex and publish a
//! fresh table atomically; workers never take a lock.

use crate::miner::worker::{Worker, WorkerContext};
use crate::utils::error::MinerError;
use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Size of the 32-bit nonce space
pub const NONCE_SPACE: u64 = 1 << 32;

/// Upper bound on concurrent workers
pub const MAX_WORKERS: usize = 256;

/// Longest delay the hashrate cap will impose after a block
pub const MAX_CAP_DELAY: Duration = Duration::from_secs(10);

/// Half-open nonce interval `[start, end)` owned by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    pub start: u64,
    pub end: u64,
}

impl NonceRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Splits the nonce space into `workers` disjoint ranges
///
/// Worker `i` gets `[i * (2^32 / N), (i + 1) * (2^32 / N))`; the last range
/// is stretched to `2^32` so the union covers every nonce.
pub fn partition_nonces(workers: usize) -> Vec<NonceRange> {
    if workers == 0 {
        return Vec::new();
    }
    let n = workers as u64;
    let span = NONCE_SPACE / n;
    (0..n)
        .map(|i| NonceRange {
            start: i * span,
            end: if i + 1 == n { NONCE_SPACE } else { (i + 1) * span },
        })
        .collect()
}

/// Sleep after a block of `active` work at `duty` percent
pub fn duty_sleep(active: Duration, duty: u8) -> Duration {
    if duty == 0 || duty >= 100 {
        return Duration::ZERO;
    }
    let duty = u32::from(duty);
    active * (100 - duty) / duty
}

/// Per-block delay that brings `observed` hashrate down to `cap`
///
/// `current` is the delay already in force while `observed` was measured;
/// it is factored out first so repeated retuning converges instead of
/// oscillating.
pub fn cap_delay(observed: f64, cap: f64, active: Duration, current: Duration) -> Duration {
    if !(cap > 0.0) || !(observed > 0.0) || active.is_zero() {
        return Duration::ZERO;
    }
    let active_secs = active.as_secs_f64();
    let raw = observed * (active_secs + current.as_secs_f64()) / active_secs;
    if raw <= cap {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(active_secs * (raw / cap - 1.0)).min(MAX_CAP_DELAY)
}

/// Why mining is paused; any active hold parks every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldReason {
    User,
    Thermal,
    Battery,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Holds {
    pub user: bool,
    pub thermal: bool,
    pub battery: bool,
}

impl Holds {
    pub fn any(&self) -> bool {
        self.user || self.thermal || self.battery
    }

    pub fn is_set(&self, reason: HoldReason) -> bool {
        match reason {
            HoldReason::User => self.user,
            HoldReason::Thermal => self.thermal,
            HoldReason::Battery => self.battery,
        }
    }

    fn set(&mut self, reason: HoldReason, on: bool) {
        match reason {
            HoldReason::User => self.user = on,
            HoldReason::Thermal => self.thermal = on,
            HoldReason::Battery => self.battery = on,
        }
    }
}

/// Snapshot read by workers between blocks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlTable {
    pub revision: u64,
    pub ranges: Vec<NonceRange>,
    pub duty_cycles: Vec<u8>,
    pub cap_delay: Duration,
    pub holds: Holds,
}

impl ControlTable {
    pub fn is_held(&self) -> bool {
        self.holds.any()
    }

    pub fn duty_cycle(&self, worker: usize) -> u8 {
        self.duty_cycles.get(worker).copied().unwrap_or(100)
    }
}

/// Atomically swapped [`ControlTable`] plus a change signal
#[derive(Debug)]
pub struct ControlCell {
    table: ArcSwap<ControlTable>,
    revision: watch::Sender<u64>,
}

impl Default for ControlCell {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        ControlCell {
            table: ArcSwap::from_pointee(ControlTable::default()),
            revision,
        }
    }
}

impl ControlCell {
    pub fn load(&self) -> Arc<ControlTable> {
        self.table.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    // callers hold the controller lock
    fn update(&self, edit: impl FnOnce(&mut ControlTable)) {
        let mut next = ControlTable::clone(&self.table.load());
        edit(&mut next);
        next.revision += 1;
        let revision = next.revision;
        self.table.store(Arc::new(next));
        self.revision.send_replace(revision);
    }
}

/// Hash and timing counters for one worker
#[derive(Debug, Default)]
pub struct WorkerMeter {
    hashes: AtomicU64,
    active_nanos: AtomicU64,
    blocks: AtomicU64,
}

impl WorkerMeter {
    pub fn record(&self, hashes: u64, active: Duration) {
        self.hashes.fetch_add(hashes, Ordering::Relaxed);
        self.active_nanos
            .fetch_add(active.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }
}

struct WorkerSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    meter: Arc<WorkerMeter>,
}

#[derive(Default)]
struct ControllerState {
    context: Option<(WorkerContext, Handle)>,
    workers: Vec<WorkerSlot>,
    retired: Vec<JoinHandle<()>>,
    default_duty: u8,
    hashrate_cap: Option<f64>,
    // (active nanos, blocks) seen at the previous retune
    last_reading: (u64, u64),
}

/// Spawns, retires and throttles the hashing workers
pub struct ResourceController {
    control: Arc<ControlCell>,
    state: Mutex<ControllerState>,
}

impl Default for ResourceController {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceController {
    pub fn new() -> Self {
        ResourceController {
            control: Arc::new(ControlCell::default()),
            state: Mutex::new(ControllerState {
                default_duty: 100,
                ..ControllerState::default()
            }),
        }
    }

    /// Current control table
    pub fn table(&self) -> Arc<ControlTable> {
        self.control.load()
    }

    /// Starts `workers` workers sharing `context`
    ///
    /// Must be called from inside a tokio runtime; later calls to
    /// [`set_worker_count`](Self::set_worker_count) spawn onto the same one.
    pub fn start(&self, context: WorkerContext, workers: usize, duty: u8) -> Result<(), MinerError> {
        validate_worker_count(workers)?;
        validate_duty(duty)?;
        let runtime = Handle::try_current()
            .map_err(|e| MinerError::TaskError(format!("no async runtime: {}", e)))?;

        {
            let mut state = self.state.lock();
            if state.context.is_some() {
                return Err(MinerError::InvalidState("workers already running".into()));
            }
            state.context = Some((context, runtime));
            state.default_duty = duty;
            state.last_reading = (0, 0);
            self.control.update(|t| {
                t.duty_cycles.clear();
                t.holds = Holds::default();
                t.cap_delay = Duration::ZERO;
            });
        }
        self.set_worker_count(workers)
    }

    /// Grows or shrinks the worker pool
    ///
    /// Every change repartitions the nonce space across the new count.
    /// Shrinking retires the highest worker ids first.
    pub fn set_worker_count(&self, workers: usize) -> Result<(), MinerError> {
        validate_worker_count(workers)?;
        let mut state = self.state.lock();
        let Some((context, runtime)) = state.context.clone() else {
            return Err(MinerError::InvalidState("workers are not running".into()));
        };

        let before = state.workers.len();
        while state.workers.len() > workers {
            if let Some(slot) = state.workers.pop() {
                slot.cancel.cancel();
                state.retired.push(slot.handle);
            }
        }

        let default_duty = state.default_duty;
        self.control.update(|t| {
            t.ranges = partition_nonces(workers);
            t.duty_cycles.resize(workers, default_duty);
        });

        for id in before..workers {
            let cancel = CancellationToken::new();
            let meter = Arc::new(WorkerMeter::default());
            let worker = Worker::new(
                id,
                context.clone(),
                self.control.clone(),
                meter.clone(),
                cancel.clone(),
            );
            let handle = runtime.spawn(worker.run());
            state.workers.push(WorkerSlot { cancel, handle, meter });
        }

        if before != workers {
            log::info!("Worker count {} -> {}", before, workers);
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Sets one worker's duty cycle, in percent (1 to 100)
    pub fn set_duty_cycle(&self, worker: usize, percent: u8) -> Result<(), MinerError> {
        validate_duty(percent)?;
        let state = self.state.lock();
        if worker >= state.workers.len() {
            return Err(MinerError::InputError(format!(
                "no worker {} (running {})",
                worker,
                state.workers.len()
            )));
        }
        self.control.update(|t| t.duty_cycles[worker] = percent);
        log::info!("Worker {} duty cycle set to {}%", worker, percent);
        Ok(())
    }

    /// Sets every worker's duty cycle, including workers spawned later
    pub fn set_all_duty_cycles(&self, percent: u8) -> Result<(), MinerError> {
        validate_duty(percent)?;
        let mut state = self.state.lock();
        state.default_duty = percent;
        self.control
            .update(|t| t.duty_cycles.iter_mut().for_each(|d| *d = percent));
        Ok(())
    }

    /// Caps the aggregate hashrate; `None` removes the cap
    pub fn set_hashrate_limit(&self, limit: Option<f64>) -> Result<(), MinerError> {
        if let Some(cap) = limit {
            if !(cap.is_finite() && cap > 0.0) {
                return Err(MinerError::InputError(format!(
                    "hashrate limit must be positive, got {}",
                    cap
                )));
            }
        }
        let mut state = self.state.lock();
        state.hashrate_cap = limit;
        if limit.is_none() {
            self.control.update(|t| t.cap_delay = Duration::ZERO);
        }
        log::info!(
            "Hashrate limit {}",
            limit.map_or_else(|| "removed".to_string(), |c| format!("set to {:.2} H/s", c))
        );
        Ok(())
    }

    /// Re-derives the cap delay from the latest observed aggregate hashrate
    pub fn retune(&self, observed: f64) {
        let mut state = self.state.lock();
        let (nanos, blocks) = state.workers.iter().fold((0u64, 0u64), |(n, b), slot| {
            (
                n + slot.meter.active_nanos.load(Ordering::Relaxed),
                b + slot.meter.blocks.load(Ordering::Relaxed),
            )
        });
        let (last_nanos, last_blocks) = state.last_reading;
        state.last_reading = (nanos, blocks);

        let Some(cap) = state.hashrate_cap else { return };
        // counters restart when the pool shrinks
        if blocks <= last_blocks || nanos < last_nanos {
            return;
        }
        let active = Duration::from_nanos((nanos - last_nanos) / (blocks - last_blocks));
        let current = self.control.load().cap_delay;
        let delay = cap_delay(observed, cap, active, current);
        if delay != current {
            log::debug!(
                "Cap retune: observed {:.2} H/s, cap {:.2} H/s, delay {:?} -> {:?}",
                observed,
                cap,
                current,
                delay
            );
            self.control.update(|t| t.cap_delay = delay);
        }
    }

    /// Adds a pause hold; returns false if it was already set
    pub fn hold(&self, reason: HoldReason) -> bool {
        self.set_hold(reason, true)
    }

    /// Lifts a pause hold; returns false if it was not set
    pub fn release(&self, reason: HoldReason) -> bool {
        self.set_hold(reason, false)
    }

    fn set_hold(&self, reason: HoldReason, on: bool) -> bool {
        let _state = self.state.lock();
        if self.control.load().holds.is_set(reason) == on {
            return false;
        }
        self.control.update(|t| t.holds.set(reason, on));
        true
    }

    pub fn holds(&self) -> Holds {
        self.control.load().holds
    }

    /// Hashes computed per running worker, by id
    pub fn worker_hashes(&self) -> Vec<u64> {
        self.state.lock().workers.iter().map(|s| s.meter.hashes()).collect()
    }

    /// Cancels every worker and waits for all of them to finish
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            state.context = None;
            let mut handles: Vec<_> = state.retired.drain(..).collect();
            for slot in state.workers.drain(..) {
                slot.cancel.cancel();
                handles.push(slot.handle);
            }
            self.control.update(|t| {
                t.ranges.clear();
                t.duty_cycles.clear();
                t.cap_delay = Duration::ZERO;
                t.holds = Holds::default();
            });
            handles
        };

        let count = handles.len();
        for result in join_all(handles).await {
            if let Err(e) = result {
                log::error!("Worker task ended abnormally: {}", e);
            }
        }
        if count > 0 {
            log::info!("Stopped {} worker(s)", count);
        }
    }
}

fn validate_worker_count(workers: usize) -> Result<(), MinerError> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(MinerError::ConfigError(format!(
            "worker count must be between 1 and {}, got {}",
            MAX_WORKERS, workers
        )));
    }
    Ok(())
}

fn validate_duty(percent: u8) -> Result<(), MinerError> {
    if !(1..=100).contains(&percent) {
        return Err(MinerError::InputError(format!(
            "duty cycle must be between 1 and 100, got {}",
            percent
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::algorithm::{self, Algorithm};
    use crate::miner::block::{Target, sha256d};
    use crate::miner::job::{Share, ShareSink, WorkBoard, WorkState, tests::sample_job};
    use crate::stats::HashCounter;
    use crate::types::AlgorithmType;
    use std::time::Instant;
    use tokio::time;

    struct NullSink;

    impl ShareSink for NullSink {
        fn submit(&self, _share: Share) -> Result<(), MinerError> {
            Ok(())
        }
    }

    fn context(board: Arc<WorkBoard>) -> (WorkerContext, Arc<HashCounter>) {
        let hashes = Arc::new(HashCounter::default());
        (
            WorkerContext {
                board,
                sink: Arc::new(NullSink),
                algorithm: algorithm::create(AlgorithmType::Sha256d),
                hashes: hashes.clone(),
            },
            hashes,
        )
    }

    /// sha256d chained `rounds` times, to make hash blocks long enough to time
    struct ChainedSha256d(usize);

    impl Algorithm for ChainedSha256d {
        fn digest(&self, input: &[u8]) -> Result<[u8; 32], MinerError> {
            let mut hash = sha256d(input);
            for _ in 1..self.0 {
                hash = sha256d(&hash);
            }
            Ok(hash)
        }

        fn algorithm_type(&self) -> AlgorithmType {
            AlgorithmType::Sha256d
        }
    }

    /// Aggregate hashrate over one window
    async fn observe(hashes: &HashCounter, window: Duration) -> f64 {
        let before = hashes.total();
        let started = Instant::now();
        time::sleep(window).await;
        (hashes.total() - before) as f64 / started.elapsed().as_secs_f64()
    }

    fn publish_easy_work(board: &WorkBoard) {
        let epoch = board.begin_clean_epoch();
        board.publish(WorkState {
            job: Arc::new(sample_job("j1", true)),
            target: Target::from_bytes([0; 32]),
            extranonce1: vec![1, 2, 3, 4],
            extranonce2_size: 4,
            clean_epoch: epoch,
        });
    }

    #[test]
    fn partitions_cover_nonce_space() {
        for n in [1usize, 2, 3, 4, 7, 8, 13] {
            let ranges = partition_nonces(n);
            assert_eq!(ranges.len(), n);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[n - 1].end, NONCE_SPACE);
            for w in ranges.windows(2) {
                assert_eq!(w[0].end, w[1].start, "gap or overlap for n={}", n);
            }
            assert_eq!(ranges.iter().map(NonceRange::len).sum::<u64>(), NONCE_SPACE);
        }
        assert_eq!(partition_nonces(4)[1], NonceRange { start: 1 << 30, end: 1 << 31 });
        assert!(partition_nonces(0).is_empty());
    }

    #[test]
    fn duty_cycle_sleep() {
        let active = Duration::from_millis(10);
        assert_eq!(duty_sleep(active, 100), Duration::ZERO);
        assert_eq!(duty_sleep(active, 50), Duration::from_millis(10));
        assert_eq!(duty_sleep(active, 25), Duration::from_millis(30));
    }

    #[test]
    fn cap_delay_converges_on_cap() {
        let active = Duration::from_millis(10);
        // 1000 H/s with no delay, cap at 500 H/s -> sleep as long as we work
        let d = cap_delay(1000.0, 500.0, active, Duration::ZERO);
        assert!((d.as_secs_f64() - 0.010).abs() < 1e-9);

        // measured while that delay was in force: rate already at the cap
        let again = cap_delay(500.0, 500.0, active, d);
        assert!((again.as_secs_f64() - d.as_secs_f64()).abs() < 1e-9);

        assert_eq!(cap_delay(400.0, 500.0, active, Duration::ZERO), Duration::ZERO);
        assert_eq!(cap_delay(1000.0, 500.0, Duration::ZERO, Duration::ZERO), Duration::ZERO);
        assert_eq!(cap_delay(1e12, 1e-6, active, Duration::ZERO), MAX_CAP_DELAY);
    }

    #[test]
    fn rejects_invalid_settings_without_runtime_state() {
        let controller = ResourceController::new();
        assert!(controller.set_worker_count(2).is_err());
        assert!(controller.set_hashrate_limit(Some(0.0)).is_err());
        assert!(controller.set_hashrate_limit(Some(f64::NAN)).is_err());
        assert!(controller.set_hashrate_limit(Some(100.0)).is_ok());
        assert!(controller.set_all_duty_cycles(0).is_err());
        assert!(controller.set_all_duty_cycles(101).is_err());
    }

    #[tokio::test]
    async fn resizing_repartitions_and_keeps_duty_cycles() {
        let board = Arc::new(WorkBoard::new());
        let (ctx, _) = context(board);
        let controller = ResourceController::new();

        assert!(controller.start(ctx.clone(), 0, 100).is_err());
        controller.start(ctx.clone(), 4, 80).unwrap();
        assert!(controller.start(ctx, 1, 80).is_err());
        assert_eq!(controller.worker_count(), 4);

        controller.set_duty_cycle(1, 40).unwrap();
        assert!(controller.set_duty_cycle(4, 40).is_err());
        assert!(controller.set_duty_cycle(0, 0).is_err());

        controller.set_worker_count(2).unwrap();
        let table = controller.table();
        assert_eq!(table.ranges, partition_nonces(2));
        assert_eq!(table.duty_cycles, vec![80, 40]);

        controller.set_worker_count(3).unwrap();
        assert_eq!(controller.table().duty_cycles, vec![80, 40, 80]);
        assert!(controller.set_worker_count(0).is_err());
        assert_eq!(controller.worker_count(), 3);

        time::timeout(Duration::from_secs(5), controller.stop()).await.unwrap();
        assert_eq!(controller.worker_count(), 0);
        assert!(controller.table().ranges.is_empty());
    }

    #[tokio::test]
    async fn holds_park_workers_until_released() {
        let board = Arc::new(WorkBoard::new());
        publish_easy_work(&board);
        let (ctx, hashes) = context(board);
        let controller = ResourceController::new();
        controller.start(ctx, 2, 100).unwrap();

        time::sleep(Duration::from_millis(100)).await;
        assert!(hashes.total() > 0);

        assert!(controller.hold(HoldReason::Thermal));
        assert!(!controller.hold(HoldReason::Thermal));
        assert!(controller.hold(HoldReason::User));
        // let in-flight blocks finish
        time::sleep(Duration::from_millis(50)).await;
        let parked = hashes.total();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hashes.total(), parked);

        assert!(controller.release(HoldReason::Thermal));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hashes.total(), parked, "user hold still active");

        assert!(controller.release(HoldReason::User));
        time::sleep(Duration::from_millis(100)).await;
        assert!(hashes.total() > parked);

        controller.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retuned_workers_settle_near_hashrate_cap() {
        let board = Arc::new(WorkBoard::new());
        publish_easy_work(&board);
        let (mut ctx, hashes) = context(board);
        ctx.algorithm = Arc::new(ChainedSha256d(4));
        let controller = ResourceController::new();
        controller.start(ctx, 2, 100).unwrap();

        let window = Duration::from_millis(250);
        time::sleep(Duration::from_millis(100)).await;
        let uncapped = observe(&hashes, window).await;
        assert!(uncapped > 0.0);

        let cap = uncapped / 4.0;
        controller.set_hashrate_limit(Some(cap)).unwrap();
        controller.retune(uncapped);
        assert!(controller.table().cap_delay > Duration::ZERO);

        let mut samples = Vec::new();
        for _ in 0..8 {
            let observed = observe(&hashes, window).await;
            controller.retune(observed);
            samples.push(observed);
        }
        controller.stop().await;

        let settled = samples[samples.len() - 3..].iter().sum::<f64>() / 3.0;
        assert!(
            settled > cap * 0.5 && settled < cap * 1.5,
            "settled at {:.0} H/s against a cap of {:.0} H/s (samples {:?})",
            settled,
            cap,
            samples
        );
    }
}
