// src/engine/orchestrator.rs
use crate::config::Config;
use crate::engine::safety::{SafetyEvent, SafetyLimits, SafetyMonitor};
use crate::engine::state::MiningState;
use crate::miner::algorithm;
use crate::miner::controller::{HoldReason, ResourceController};
use crate::miner::job::WorkBoard;
use crate::miner::worker::WorkerContext;
use crate::network::{ConnectionState, PoolConnection, StratumClient};
use crate::stats::{DeviceSample, DeviceSensors, RunningStats, StatsReporter, SystemSensors};
use crate::utils::error::MinerError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Resource monitor of a running session
struct Session {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

struct EngineInner {
    state: watch::Sender<MiningState>,
    connection: PoolConnection,
    controller: ResourceController,
    stats: StatsReporter,
    sensors: Mutex<Box<dyn DeviceSensors>>,
    session: Mutex<Option<Session>>,
    // serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    start_cancel: Mutex<Option<CancellationToken>>,
}

/// Top-level coordinator of a mining session
///
/// Owns the pool connection, the worker pool and the resource monitor,
/// and is the only writer of [`MiningState`]. Cloning is cheap and every
/// clone drives the same session.
#[derive(Clone)]
pub struct MiningEngine {
    inner: Arc<EngineInner>,
}

impl MiningEngine {
    /// Creates a stopped engine reading device telemetry from `sensors`
    pub fn new(sensors: Box<dyn DeviceSensors>) -> Self {
        let board = Arc::new(WorkBoard::new());
        let client = StratumClient::new(board);
        let (state, _) = watch::channel(MiningState::Stopped);
        MiningEngine {
            inner: Arc::new(EngineInner {
                state,
                connection: PoolConnection::new(client, Default::default()),
                controller: ResourceController::new(),
                stats: StatsReporter::new(Duration::from_secs(60)),
                sensors: Mutex::new(sensors),
                session: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                start_cancel: Mutex::new(None),
            }),
        }
    }

    /// Engine backed by [`SystemSensors`]
    pub fn with_system_sensors() -> Self {
        Self::new(Box::new(SystemSensors::new()))
    }

    /// Starts a session
    ///
    /// The configuration is validated before anything else happens. Only
    /// a stopped engine can start; an engine in `Error` must be stopped
    /// first. Returns once the pool handshake finished and the workers
    /// are running; any failure on the way leaves the engine in `Error`.
    pub async fn start(&self, config: Config) -> Result<(), MinerError> {
        config.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self.state();
        if current != MiningState::Stopped {
            return Err(MinerError::InvalidState(format!(
                "cannot start while {}",
                current
            )));
        }
        self.inner.transition(MiningState::Starting);
        log::info!(
            "Starting {} mining on {} with {} worker(s)",
            config.algorithm,
            config.pool.url,
            config.resources.worker_count
        );

        let cancel = CancellationToken::new();
        *self.inner.start_cancel.lock() = Some(cancel.clone());
        let result = self.launch(&config, &cancel).await;
        self.inner.start_cancel.lock().take();

        match result {
            Ok(()) => {
                self.inner.refresh_state();
                Ok(())
            }
            Err(e) => {
                self.inner.teardown().await;
                if cancel.is_cancelled() {
                    log::info!("Start interrupted by stop");
                } else {
                    log::error!("Failed to start mining: {}", e);
                    self.inner.transition(MiningState::Error(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, config: &Config, cancel: &CancellationToken) -> Result<(), MinerError> {
        let inner = &self.inner;
        let resources = &config.resources;

        inner.stats.reset();
        inner
            .stats
            .set_report_interval(Duration::from_secs(resources.report_interval_secs));
        inner.connection.client().reset_counters();
        inner.connection.set_settings(config.connection.settings());

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(MinerError::InvalidState("start cancelled".into()));
            }
            result = inner.connection.connect(&config.pool.url, config.pool.credentials()) => result?,
        }

        let algorithm = algorithm::create(config.algorithm);
        if !algorithm.is_available() {
            log::warn!(
                "{} has no hashing backend in this build; workers will stay idle",
                config.algorithm
            );
        }
        let client = inner.connection.client().clone();
        let context = WorkerContext {
            board: client.board(),
            sink: Arc::new(client),
            algorithm,
            hashes: inner.stats.hash_counter(),
        };
        inner
            .controller
            .start(context, resources.worker_count, resources.duty_cycle)?;
        inner.controller.set_hashrate_limit(resources.hashrate_limit)?;

        let session_cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            inner.clone(),
            SafetyMonitor::new(SafetyLimits::from(resources)),
            Duration::from_millis(resources.monitor_interval_ms),
            session_cancel.clone(),
        ));
        *inner.session.lock() = Some(Session {
            cancel: session_cancel,
            monitor,
        });

        inner.transition(MiningState::Mining);
        Ok(())
    }

    /// Stops everything and returns to `Stopped`
    ///
    /// Safe from any state, including while a start is still connecting or
    /// the pool connection is backing off. Workers and the monitor have
    /// finished by the time this returns.
    pub async fn stop(&self) {
        if let Some(cancel) = self.inner.start_cancel.lock().take() {
            cancel.cancel();
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown().await;
        if self.state() != MiningState::Stopped {
            self.inner.transition(MiningState::Stopped);
            log::info!("Mining stopped");
        }
    }

    /// Parks every worker until [`resume`](Self::resume)
    pub fn pause(&self) -> Result<(), MinerError> {
        self.inner.require_active("pause")?;
        if self.inner.controller.hold(HoldReason::User) {
            log::info!("Mining paused by user");
        }
        self.inner.refresh_state();
        Ok(())
    }

    /// Lifts a user pause; safety holds stay in force
    pub fn resume(&self) -> Result<(), MinerError> {
        self.inner.require_active("resume")?;
        if self.inner.controller.release(HoldReason::User) {
            log::info!("Mining resumed by user");
        }
        self.inner.refresh_state();
        Ok(())
    }

    pub fn set_worker_count(&self, workers: usize) -> Result<(), MinerError> {
        self.inner.controller.set_worker_count(workers)
    }

    /// Caps the aggregate hashrate; `None` removes the cap
    pub fn set_hashrate_limit(&self, limit: Option<f64>) -> Result<(), MinerError> {
        self.inner.require_active("change the hashrate limit")?;
        self.inner.controller.set_hashrate_limit(limit)
    }

    pub fn set_duty_cycle(&self, worker: usize, percent: u8) -> Result<(), MinerError> {
        self.inner.controller.set_duty_cycle(worker, percent)
    }

    pub fn state(&self) -> MiningState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MiningState> {
        self.inner.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Statistics published by the last monitor tick
    pub fn stats(&self) -> RunningStats {
        self.inner.stats.latest()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<RunningStats> {
        self.inner.stats.subscribe()
    }

    /// Running worker tasks
    pub fn worker_count(&self) -> usize {
        self.inner.controller.worker_count()
    }
}

impl EngineInner {
    fn transition(&self, next: MiningState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                log::debug!("Ignoring transition {} -> {}", current, next);
                return false;
            }
            log::debug!("Mining state {} -> {}", current, next);
            *current = next;
            true
        })
    }

    /// Re-derives the label of an active session from the current holds
    fn refresh_state(&self) {
        if !self.state.borrow().is_active() {
            return;
        }
        let holds = self.controller.holds();
        let next = if holds.thermal {
            MiningState::Throttled
        } else if holds.user || holds.battery {
            MiningState::Paused
        } else {
            MiningState::Mining
        };
        self.transition(next);
    }

    fn require_active(&self, action: &str) -> Result<(), MinerError> {
        let state = self.state.borrow().clone();
        if state.is_active() {
            Ok(())
        } else {
            Err(MinerError::InvalidState(format!(
                "cannot {} while {}",
                action, state
            )))
        }
    }

    /// Stops the monitor, the workers and the connection, in that order
    async fn teardown(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.monitor.await {
                log::warn!("Resource monitor ended abnormally: {}", e);
            }
        }
        self.controller.stop().await;
        self.connection.disconnect().await;
    }

    fn sample(&self) -> DeviceSample {
        self.sensors.lock().sample()
    }

    /// One monitor tick; false once the session has failed
    async fn tick(&self, safety: &mut SafetyMonitor) -> bool {
        let sample = self.sample();
        let mining = *self.state.borrow() == MiningState::Mining;

        for event in safety.evaluate(&sample, Instant::now(), mining) {
            self.apply(event, &sample, safety.limits());
        }

        if let ConnectionState::Error { reason, attempts } = self.connection.state() {
            log::error!(
                "Pool connection failed after {} attempt(s): {}",
                attempts,
                reason
            );
            self.controller.stop().await;
            self.transition(MiningState::Error(reason));
            return false;
        }
        self.refresh_state();

        let stats = self.stats.sample(
            self.connection.client().counters(),
            &sample,
            self.controller.worker_count(),
        );
        self.controller.retune(stats.hashrate);
        true
    }

    fn apply(&self, event: SafetyEvent, sample: &DeviceSample, limits: &SafetyLimits) {
        match event {
            SafetyEvent::ThermalTripped => {
                log::warn!(
                    "Temperature {:.1}°C above {:.1}°C, throttling for {:?}",
                    sample.temperature.unwrap_or_default(),
                    limits.max_temperature,
                    limits.thermal_cooldown
                );
                self.controller.hold(HoldReason::Thermal);
            }
            SafetyEvent::ThermalCooled => {
                log::info!("Thermal cooldown finished");
                self.controller.release(HoldReason::Thermal);
            }
            SafetyEvent::BatteryHeld => {
                log::warn!(
                    "Battery protection engaged ({}), pausing",
                    sample
                        .battery
                        .map_or_else(|| "n/a".to_string(), |b| format!("{}%", b.level))
                );
                self.controller.hold(HoldReason::Battery);
            }
            SafetyEvent::BatteryReleased => {
                log::info!("Battery recovered, resuming");
                self.controller.release(HoldReason::Battery);
            }
        }
    }
}

async fn monitor(
    inner: Arc<EngineInner>,
    mut safety: SafetyMonitor,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !inner.tick(&mut safety).await {
            break;
        }
    }
    log::debug!("Resource monitor stopped");
}
