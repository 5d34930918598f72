// tests/mining_session.rs
//! End-to-end sessions against an in-process stratum pool

use mobile_miner_rs::stats::BatteryStatus;
use mobile_miner_rs::{
    Config, ConnectionState, DeviceSample, DeviceSensors, MinerError, MiningEngine, MiningState,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

/// Sensors whose readings the test sets directly
#[derive(Clone, Default)]
struct ScriptedSensors(Arc<Mutex<DeviceSample>>);

impl ScriptedSensors {
    fn set(&self, update: impl FnOnce(&mut DeviceSample)) {
        update(&mut self.0.lock());
    }
}

impl DeviceSensors for ScriptedSensors {
    fn sample(&mut self) -> DeviceSample {
        *self.0.lock()
    }
}

/// One accepted client connection on the mock pool
struct PoolSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl PoolSession {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read, write) = socket.into_split();
        PoolSession {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    /// Answers subscribe and authorize
    async fn handshake(listener: &TcpListener) -> Self {
        let mut session = Self::accept(listener).await;
        let subscribe = session.next_request().await.unwrap();
        assert_eq!(subscribe["method"], "mining.subscribe");
        let authorize = session.next_request().await.unwrap();
        assert_eq!(authorize["method"], "mining.authorize");
        assert_eq!(authorize["params"][0], "wallet.rig");

        session
            .send(json!({"id": subscribe["id"], "result": [[], "0a0b0c0d", 4], "error": null}))
            .await;
        session
            .send(json!({"id": authorize["id"], "result": true, "error": null}))
            .await;
        session
    }

    async fn send(&mut self, message: Value) {
        self.write
            .write_all(format!("{}\n", message).as_bytes())
            .await
            .unwrap();
    }

    async fn next_request(&mut self) -> Option<Value> {
        let line = timeout(WAIT, self.lines.next_line()).await.ok()?.ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn set_difficulty(&mut self, difficulty: f64) {
        self.send(json!({"id": null, "method": "mining.set_difficulty", "params": [difficulty]}))
            .await;
    }

    async fn notify(&mut self, job_id: &str, clean: bool) {
        self.send(json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                job_id,
                "00".repeat(32),
                "01000000010000000000",
                "ffffffff0100f2052a01000000",
                ["11".repeat(32), "22".repeat(32)],
                "20000000",
                "1d00ffff",
                "5f5e1000",
                clean
            ]
        }))
        .await;
    }
}

fn config(port: u16) -> Config {
    let mut config = Config::new(format!("stratum+tcp://127.0.0.1:{}", port), "wallet");
    config.pool.worker = "rig".into();
    config.resources.worker_count = 2;
    config.resources.monitor_interval_ms = 20;
    config.resources.thermal_cooldown_ms = 300;
    config.connection.reconnect_base_delay_ms = 50;
    config.connection.watchdog_interval_ms = 50;
    config.connection.handshake_timeout_ms = 2_000;
    config
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, what: &str, predicate: impl FnMut(&T) -> bool) {
    match timeout(WAIT, rx.wait_for(predicate)).await {
        Ok(Ok(_)) => {}
        _ => panic!("timed out waiting for {}", what),
    }
}

/// Starts an engine against a fresh mock pool that has issued one job
async fn mining_session(
    config_for: impl FnOnce(u16) -> Config,
) -> (MiningEngine, ScriptedSensors, TcpListener, PoolSession) {
    let (listener, port) = bind().await;
    let sensors = ScriptedSensors::default();
    let engine = MiningEngine::new(Box::new(sensors.clone()));

    let starting = tokio::spawn({
        let engine = engine.clone();
        let config = config_for(port);
        async move { engine.start(config).await }
    });
    let mut pool = PoolSession::handshake(&listener).await;
    starting.await.unwrap().unwrap();
    assert_eq!(engine.state(), MiningState::Mining);

    pool.notify("1", true).await;
    (engine, sensors, listener, pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overheating_throttles_then_resumes_after_cooldown() {
    let (engine, sensors, _listener, _pool) = mining_session(config).await;
    let mut stats = engine.subscribe_stats();
    let mut state = engine.subscribe_state();
    wait_for(&mut stats, "hashing to begin", |s| s.total_hashes > 0).await;

    sensors.set(|s| s.temperature = Some(95.0));
    wait_for(&mut state, "throttle", |s| *s == MiningState::Throttled).await;

    // workers park at their next block boundary
    sleep(Duration::from_millis(60)).await;
    let parked = engine.stats().total_hashes;
    sleep(Duration::from_millis(80)).await;
    if engine.state() == MiningState::Throttled {
        assert_eq!(engine.stats().total_hashes, parked);
    }

    sensors.set(|s| s.temperature = Some(45.0));
    wait_for(&mut state, "cooldown to end", |s| *s == MiningState::Mining).await;
    wait_for(&mut stats, "hashing to resume", |s| s.total_hashes > parked).await;

    engine.stop().await;
    assert_eq!(engine.state(), MiningState::Stopped);
    assert_eq!(engine.worker_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_job_retires_shares_for_the_previous_job() {
    let (engine, _sensors, _listener, mut pool) = mining_session(config).await;
    pool.set_difficulty(0.000001).await;
    pool.notify("1", true).await;

    let mut superseded = false;
    let mut fresh = 0;
    while fresh < 3 {
        let request = pool.next_request().await.expect("pool stopped receiving shares");
        assert_eq!(request["method"], "mining.submit");
        let params = request["params"].as_array().unwrap();
        assert_eq!(params.len(), 5);
        assert_eq!(params[0], "0a0b0c0d");
        assert_eq!(params[1].as_str().unwrap().len(), 8);
        assert_eq!(params[2], "5f5e1000");
        assert_eq!(params[3].as_str().unwrap().len(), 8);

        match params[4].as_str().unwrap() {
            "1" => {
                assert!(fresh == 0, "share for job 1 after a share for job 2");
                if !superseded {
                    pool.notify("2", true).await;
                    superseded = true;
                }
            }
            "2" => {
                assert!(superseded);
                fresh += 1;
            }
            other => panic!("unexpected job {}", other),
        }
        pool.send(json!({"id": request["id"], "result": true, "error": null}))
            .await;
    }

    let mut stats = engine.subscribe_stats();
    wait_for(&mut stats, "accepted shares", |s| s.shares.accepted >= 3).await;
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_battery_pauses_until_recharged() {
    let (engine, sensors, _listener, _pool) = mining_session(config).await;
    let mut state = engine.subscribe_state();

    sensors.set(|s| {
        s.battery = Some(BatteryStatus {
            level: 12,
            charging: false,
            temperature: Some(30.0),
        })
    });
    wait_for(&mut state, "battery pause", |s| *s == MiningState::Paused).await;

    // plugged in but still under the resume margin
    sensors.set(|s| {
        s.battery = Some(BatteryStatus {
            level: 25,
            charging: true,
            temperature: Some(30.0),
        })
    });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.state(), MiningState::Paused);

    sensors.set(|s| {
        s.battery = Some(BatteryStatus {
            level: 31,
            charging: true,
            temperature: Some(30.0),
        })
    });
    wait_for(&mut state, "battery resume", |s| *s == MiningState::Mining).await;
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_commands_during_a_session() {
    let (engine, _sensors, _listener, _pool) = mining_session(config).await;

    engine.pause().unwrap();
    assert_eq!(engine.state(), MiningState::Paused);
    engine.pause().unwrap();
    engine.resume().unwrap();
    assert_eq!(engine.state(), MiningState::Mining);

    engine.set_worker_count(3).unwrap();
    assert_eq!(engine.worker_count(), 3);
    engine.set_duty_cycle(2, 50).unwrap();
    engine.set_hashrate_limit(Some(1_000.0)).unwrap();
    engine.set_hashrate_limit(None).unwrap();

    assert!(matches!(engine.set_worker_count(0), Err(MinerError::ConfigError(_))));
    assert!(matches!(engine.set_duty_cycle(7, 50), Err(MinerError::InputError(_))));
    assert!(matches!(engine.set_duty_cycle(0, 0), Err(MinerError::InputError(_))));
    assert!(engine.set_hashrate_limit(Some(-5.0)).is_err());
    assert_eq!(engine.worker_count(), 3);

    // a second start while running is refused
    assert!(matches!(
        engine.start(config(1)).await,
        Err(MinerError::InvalidState(_))
    ));

    engine.stop().await;
    assert_eq!(engine.state(), MiningState::Stopped);
    assert!(engine.pause().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_when_the_pool_drops_the_session() {
    let (engine, _sensors, listener, pool) = mining_session(config).await;
    let mut connection = engine.subscribe_connection();
    drop(pool);

    wait_for(&mut connection, "reconnect attempt", |c| {
        matches!(c, ConnectionState::Reconnecting { .. })
    })
    .await;
    let mut pool = PoolSession::handshake(&listener).await;
    wait_for(&mut connection, "session restored", |c| {
        matches!(c, ConnectionState::Connected { .. })
    })
    .await;

    pool.notify("7", true).await;
    let mut stats = engine.subscribe_stats();
    let before = engine.stats().total_hashes;
    wait_for(&mut stats, "hashing on the new session", |s| s.total_hashes > before).await;
    assert!(engine.state().is_active());
    engine.stop().await;
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_reconnects_put_the_engine_in_error() {
    let (engine, _sensors, listener, pool) = mining_session(|port| {
        let mut config = config(port);
        config.connection.max_reconnect_attempts = 2;
        config.connection.reconnect_base_delay_ms = 20;
        config
    })
    .await;
    let mut state = engine.subscribe_state();
    drop(listener);
    drop(pool);

    wait_for(&mut state, "error state", |s| matches!(s, MiningState::Error(_))).await;
    assert!(matches!(
        engine.connection_state(),
        ConnectionState::Error { attempts: 2, .. }
    ));
    assert_eq!(engine.worker_count(), 0);
    assert!(engine.resume().is_err());

    engine.stop().await;
    assert_eq!(engine.state(), MiningState::Stopped);
}

#[tokio::test]
async fn stop_interrupts_a_pending_start() {
    let (listener, port) = bind().await;
    let engine = MiningEngine::new(Box::new(ScriptedSensors::default()));
    let mut config = config(port);
    config.connection.handshake_timeout_ms = 30_000;

    let starting = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start(config).await }
    });
    // accept but never answer the handshake
    let _silent = PoolSession::accept(&listener).await;
    let mut state = engine.subscribe_state();
    wait_for(&mut state, "starting", |s| *s == MiningState::Starting).await;

    timeout(WAIT, engine.stop()).await.unwrap();
    assert!(starting.await.unwrap().is_err());
    assert_eq!(engine.state(), MiningState::Stopped);
}
