// src/network/connection.rs
//! Pool connection supervision
//!
//! Wraps a [`StratumClient`] with a watchdog that notices lost sessions and
//! reconnects with linear backoff. The observable [`ConnectionState`] is
//! published on a watch channel.

use crate::network::pool::{Credentials, PoolEndpoint, StratumClient};
use crate::utils::error::MinerError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Observable state of the pool connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { endpoint: String, latency: Duration },
    Reconnecting { attempt: u32 },
    /// Terminal until the next explicit connect
    Error { reason: String, attempts: u32 },
}

/// Linear backoff: attempt `n` waits `base_delay * n`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based), `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(attempt))
    }
}

/// Timing knobs for [`PoolConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub policy: ReconnectPolicy,
    pub watchdog_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            policy: ReconnectPolicy::default(),
            watchdog_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ConnectionInner {
    client: StratumClient,
    settings: Mutex<ConnectionSettings>,
    state: watch::Sender<ConnectionState>,
    supervisor: Mutex<Option<Supervisor>>,
}

/// A supervised pool connection
#[derive(Clone)]
pub struct PoolConnection {
    inner: Arc<ConnectionInner>,
}

impl PoolConnection {
    pub fn new(client: StratumClient, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        PoolConnection {
            inner: Arc::new(ConnectionInner {
                client,
                settings: Mutex::new(settings),
                state,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn client(&self) -> &StratumClient {
        &self.inner.client
    }

    /// Replaces the timing used by the next [`connect`](Self::connect)
    pub fn set_settings(&self, settings: ConnectionSettings) {
        *self.inner.settings.lock() = settings;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connects to `url` and starts the watchdog
    ///
    /// The URL is validated before any network activity. A failed initial
    /// connect leaves the state at `Error` with zero attempts; only sessions
    /// that were once up are retried automatically.
    pub async fn connect(&self, url: &str, credentials: Credentials) -> Result<(), MinerError> {
        let endpoint = PoolEndpoint::parse(url)?;
        self.stop_supervisor().await;
        let settings = *self.inner.settings.lock();
        self.inner.set_state(ConnectionState::Connecting);

        let latency = match self
            .inner
            .client
            .connect(&endpoint, &credentials, settings.handshake_timeout)
            .await
        {
            Ok(latency) => latency,
            Err(e) => {
                log::error!("Could not connect to {}: {}", endpoint, e);
                self.inner.set_state(ConnectionState::Error {
                    reason: e.to_string(),
                    attempts: 0,
                });
                return Err(e);
            }
        };
        self.inner.set_state(ConnectionState::Connected {
            endpoint: endpoint.to_string(),
            latency,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            self.inner.clone(),
            settings,
            endpoint,
            credentials,
            cancel.clone(),
        ));
        *self.inner.supervisor.lock() = Some(Supervisor { cancel, handle });
        Ok(())
    }

    /// Stops supervision and closes the session
    ///
    /// Safe in any state, including while a reconnect is pending.
    pub async fn disconnect(&self) {
        self.stop_supervisor().await;
        self.inner.client.disconnect();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                log::warn!("Connection supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Runs the backoff loop; false when attempts ran out or on cancel
    async fn reconnect(
        &self,
        settings: &ConnectionSettings,
        endpoint: &PoolEndpoint,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> bool {
        let policy = settings.policy;
        let mut attempt = 0u32;
        let mut last_error = String::from("connection lost");

        loop {
            attempt += 1;
            let Some(delay) = policy.delay_for(attempt) else {
                log::error!(
                    "Giving up on {} after {} reconnection attempts",
                    endpoint,
                    attempt - 1
                );
                self.set_state(ConnectionState::Error {
                    reason: format!("Max reconnection attempts reached: {}", last_error),
                    attempts: attempt - 1,
                });
                return false;
            };

            self.set_state(ConnectionState::Reconnecting { attempt });
            log::warn!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                endpoint,
                delay,
                attempt,
                policy.max_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.client.connect(endpoint, credentials, settings.handshake_timeout) => result,
            };
            match result {
                Ok(latency) => {
                    log::info!("Reconnected to {} after {} attempt(s)", endpoint, attempt);
                    self.set_state(ConnectionState::Connected {
                        endpoint: endpoint.to_string(),
                        latency,
                    });
                    return true;
                }
                Err(e) => {
                    log::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }
    }
}

/// Watchdog: polls liveness every interval and also reacts to status changes
async fn supervise(
    inner: Arc<ConnectionInner>,
    settings: ConnectionSettings,
    endpoint: PoolEndpoint,
    credentials: Credentials,
    cancel: CancellationToken,
) {
    let mut status = inner.client.subscribe_status();
    let mut ticker = time::interval(settings.watchdog_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        if inner.client.is_connected() {
            continue;
        }
        log::warn!("Pool session to {} is down", endpoint);
        if !inner.reconnect(&settings, &endpoint, &credentials, &cancel).await {
            return;
        }
        status.borrow_and_update();
        ticker.reset();
    }
}
