// src/network/pool.rs

//! Stratum v1 pool client
//!
//! Owns one TCP session at a time. A reader task decodes newline-delimited
//! JSON from the pool and is the only writer of the shared [`WorkBoard`];
//! a writer task drains an unbounded queue of outbound lines so that share
//! submission never blocks a worker.
use crate::miner::block::Target;
use crate::miner::job::{Job, Share, ShareSink, WorkBoard, WorkState};
use crate::network::messages::{self, Inbound, Request, Response, Subscription};
use crate::utils::error::MinerError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

/// Identifier sent in `mining.subscribe`
pub const CLIENT_ID: &str = concat!("mobile-miner/", env!("CARGO_PKG_VERSION"));

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Host and port of a stratum pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEndpoint {
    pub host: String,
    pub port: u16,
}

impl PoolEndpoint {
    /// Parses `stratum+tcp://host:port`; a bare `host:port` is accepted too
    ///
    /// # Errors
    /// Returns `MinerError::ConfigError` for unknown schemes or when the
    /// host or port is missing.
    pub fn parse(url: &str) -> Result<Self, MinerError> {
        let url = url.trim();
        let full = if url.contains("://") {
            url.to_string()
        } else {
            format!("stratum+tcp://{}", url)
        };
        let parsed = Url::parse(&full)
            .map_err(|e| MinerError::ConfigError(format!("Invalid pool URL '{}': {}", url, e)))?;

        match parsed.scheme() {
            "stratum+tcp" | "stratum" | "tcp" => {}
            other => {
                return Err(MinerError::ConfigError(format!(
                    "Unsupported pool scheme '{}' in '{}'",
                    other, url
                )));
            }
        }

        let host = match parsed.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(MinerError::ConfigError(format!(
                    "Pool URL '{}' has no host",
                    url
                )));
            }
        };
        let port = parsed
            .port()
            .ok_or_else(|| MinerError::ConfigError(format!("Pool URL '{}' has no port", url)))?;

        Ok(PoolEndpoint { host, port })
    }
}

impl fmt::Display for PoolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Login sent in `mining.authorize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// `wallet.worker`
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(wallet: &str, worker: &str, password: &str) -> Self {
        Credentials {
            username: format!("{}.{}", wallet, worker),
            password: password.to_string(),
        }
    }
}

/// Transport status of the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Share bookkeeping for the current client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareCounters {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Found on a job that a clean notify had already replaced
    pub stale: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRequest {
    Subscribe,
    Authorize,
    Submit { job_id: String },
}

struct Link {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Session {
    generation: u64,
    link: Option<Link>,
    subscription: Option<Subscription>,
    difficulty: Option<f64>,
    job: Option<Arc<Job>>,
    authorized: bool,
    /// Resolves once subscribe and authorize have both succeeded
    handshake: Option<oneshot::Sender<Result<(), String>>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
}

struct ClientInner {
    board: Arc<WorkBoard>,
    status: watch::Sender<ClientStatus>,
    // lock order: session before pending
    session: Mutex<Session>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Stratum v1 client
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct StratumClient {
    inner: Arc<ClientInner>,
}

impl Default for StratumClient {
    fn default() -> Self {
        Self::new(Arc::new(WorkBoard::new()))
    }
}

impl StratumClient {
    /// Creates a disconnected client publishing work to `board`
    pub fn new(board: Arc<WorkBoard>) -> Self {
        let (status, _) = watch::channel(ClientStatus::Disconnected);
        StratumClient {
            inner: Arc::new(ClientInner {
                board,
                status,
                session: Mutex::new(Session::default()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Board the receive loop publishes jobs to
    pub fn board(&self) -> Arc<WorkBoard> {
        self.inner.board.clone()
    }

    /// Opens a session and completes the subscribe handshake
    ///
    /// Any previous session is closed first. Status becomes `Connected` as
    /// soon as the socket is up; subscribe and authorize are then sent and
    /// the call waits for the subscribe reply, bounded by `handshake_timeout`
    /// together with the TCP connect.
    ///
    /// # Returns
    /// Time from the start of the call to the completed handshake
    pub async fn connect(
        &self,
        endpoint: &PoolEndpoint,
        credentials: &Credentials,
        handshake_timeout: Duration,
    ) -> Result<Duration, MinerError> {
        self.disconnect();
        self.inner.set_status(ClientStatus::Connecting);
        let started = Instant::now();

        let outcome = time::timeout(handshake_timeout, self.open(endpoint, credentials)).await;
        match outcome {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                log::info!("Connected to {} in {} ms", endpoint, latency.as_millis());
                Ok(latency)
            }
            Ok(Err(e)) => {
                self.inner.close_session();
                self.inner.set_status(ClientStatus::Error(e.to_string()));
                Err(e)
            }
            Err(_) => {
                let e = MinerError::Timeout(format!(
                    "handshake with {} took longer than {:?}",
                    endpoint, handshake_timeout
                ));
                self.inner.close_session();
                self.inner.set_status(ClientStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open(&self, endpoint: &PoolEndpoint, credentials: &Credentials) -> Result<(), MinerError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| MinerError::ConnectionError(format!("Connection to {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let generation = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.link = Some(Link {
                outbound,
                cancel: cancel.clone(),
            });
            session.handshake = Some(handshake_tx);
            session.authorized = false;
            session.subscription = None;
            session.difficulty = None;
            session.job = None;
            session.generation
        };

        tokio::spawn(read_loop(
            self.inner.clone(),
            generation,
            FramedRead::new(reader, line_codec()),
            cancel.clone(),
        ));
        tokio::spawn(write_loop(
            self.inner.clone(),
            generation,
            FramedWrite::new(writer, LinesCodec::new()),
            outbound_rx,
            cancel,
        ));
        self.inner.set_status(ClientStatus::Connected);

        {
            let session = self.inner.session.lock();
            self.inner.enqueue(&session, PendingRequest::Subscribe, |id| {
                Request::subscribe(id, CLIENT_ID, &endpoint.host, endpoint.port)
            })?;
            self.inner.enqueue(&session, PendingRequest::Authorize, |id| {
                Request::authorize(id, &credentials.username, &credentials.password)
            })?;
        }

        match handshake_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(MinerError::ProtocolError(reason)),
            Err(_) => Err(MinerError::ConnectionError(
                "connection closed during handshake".into(),
            )),
        }
    }

    /// Closes the session, if any; safe to call repeatedly
    pub fn disconnect(&self) {
        if self.inner.close_session() {
            log::info!("Disconnected from pool");
        }
        self.inner.set_status(ClientStatus::Disconnected);
    }

    /// True while a session is open
    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == ClientStatus::Connected
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    pub fn counters(&self) -> ShareCounters {
        let c = &self.inner.counters;
        ShareCounters {
            submitted: c.submitted.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
        }
    }

    /// Clears share counters for a fresh mining session
    pub fn reset_counters(&self) {
        let c = &self.inner.counters;
        for counter in [&c.submitted, &c.accepted, &c.rejected, &c.stale] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl ShareSink for StratumClient {
    /// Queues a `mining.submit`
    ///
    /// Shares from an epoch that a clean notify has closed are counted as
    /// stale and dropped. The check and the enqueue happen under the session
    /// lock, which the receive loop also holds while opening a new epoch.
    fn submit(&self, share: Share) -> Result<(), MinerError> {
        let inner = &self.inner;
        let session = inner.session.lock();

        if share.clean_epoch != inner.board.clean_epoch() {
            inner.counters.stale.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping stale share for job {}", share.job_id);
            return Ok(());
        }

        let extranonce1 = session
            .subscription
            .as_ref()
            .map(|s| hex::encode(&s.extranonce1))
            .ok_or_else(|| MinerError::ConnectionError("Not subscribed".into()))?;

        inner.enqueue(
            &session,
            PendingRequest::Submit {
                job_id: share.job_id.clone(),
            },
            |id| {
                Request::submit(
                    id,
                    &extranonce1,
                    &share.extranonce2,
                    &share.time,
                    &share.nonce_hex(),
                    &share.job_id,
                )
            },
        )?;
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        log::info!("Submitted share for job {} (nonce {})", share.job_id, share.nonce_hex());
        Ok(())
    }
}

impl ClientInner {
    fn set_status(&self, status: ClientStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn enqueue(
        &self,
        session: &Session,
        kind: PendingRequest,
        build: impl FnOnce(u64) -> Request,
    ) -> Result<u64, MinerError> {
        let link = session
            .link
            .as_ref()
            .ok_or_else(|| MinerError::ConnectionError("Not connected".into()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = build(id).to_line()?;

        self.pending.lock().insert(id, kind);
        if let Err(e) = link.outbound.send(line) {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }
        Ok(id)
    }

    /// Drops the current link and withdraws its work; true if one was open
    fn close_session(&self) -> bool {
        let mut session = self.session.lock();
        let had_link = match session.link.take() {
            Some(link) => {
                link.cancel.cancel();
                true
            }
            None => false,
        };
        session.handshake = None;
        session.authorized = false;
        session.subscription = None;
        session.difficulty = None;
        session.job = None;
        self.board.clear();
        drop(session);

        self.pending.lock().clear();
        had_link
    }

    /// Reaction to the remote side going away
    fn link_lost(&self, generation: u64, reason: &str) {
        {
            let session = self.session.lock();
            if session.generation != generation || session.link.is_none() {
                return;
            }
        }
        log::warn!("Pool connection lost: {}", reason);
        self.close_session();
        self.set_status(ClientStatus::Disconnected);
    }

    fn handle_line(&self, generation: u64, line: &str) {
        let message = match messages::parse_inbound(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed pool message: {}", e);
                return;
            }
        };

        match message {
            Inbound::Notify(job) => self.on_notify(generation, job),
            Inbound::SetDifficulty(difficulty) => self.on_difficulty(generation, difficulty),
            Inbound::Reconnect => self.link_lost(generation, "pool requested reconnect"),
            Inbound::Response(response) => self.on_response(generation, response),
            Inbound::Unknown(method) => log::debug!("Ignoring pool notification {}", method),
        }
    }

    fn on_notify(&self, generation: u64, job: Job) {
        if let Err(e) = job.validate() {
            log::warn!("Dropping invalid job {}: {}", job.job_id, e);
            return;
        }

        let mut session = self.session.lock();
        if session.generation != generation {
            return;
        }
        if job.clean_jobs {
            let epoch = self.board.begin_clean_epoch();
            log::debug!("Job {} opens clean epoch {}", job.job_id, epoch);
        }
        log::info!("New job {} (clean: {})", job.job_id, job.clean_jobs);
        session.job = Some(Arc::new(job));
        self.publish(&session);
    }

    fn on_difficulty(&self, generation: u64, difficulty: f64) {
        if let Err(e) = Target::from_difficulty(difficulty) {
            log::warn!("Ignoring difficulty {}: {}", difficulty, e);
            return;
        }

        let mut session = self.session.lock();
        if session.generation != generation {
            return;
        }
        log::info!("Pool difficulty set to {}", difficulty);
        session.difficulty = Some(difficulty);
        self.publish(&session);
    }

    fn on_response(&self, generation: u64, response: Response) {
        let kind = self.pending.lock().remove(&response.id);
        match kind {
            Some(PendingRequest::Subscribe) => {
                let mut session = self.session.lock();
                if session.generation != generation {
                    return;
                }
                let outcome = match response.error_text() {
                    Some(reason) => Err(format!("subscribe rejected: {}", reason)),
                    None => match messages::parse_subscription(&response.result) {
                        Ok(subscription) => {
                            log::info!(
                                "Subscribed: extranonce1={} extranonce2_size={}",
                                hex::encode(&subscription.extranonce1),
                                subscription.extranonce2_size
                            );
                            session.subscription = Some(subscription);
                            self.publish(&session);
                            Ok(())
                        }
                        Err(e) => Err(e.to_string()),
                    },
                };
                if outcome.is_err() || session.authorized {
                    finish_handshake(&mut session, outcome);
                }
            }
            Some(PendingRequest::Authorize) => {
                let mut session = self.session.lock();
                if session.generation != generation {
                    return;
                }
                if response.is_success() {
                    log::info!("Worker authorized");
                    session.authorized = true;
                    if session.subscription.is_some() {
                        finish_handshake(&mut session, Ok(()));
                    }
                } else {
                    let reason = format!(
                        "authorization rejected: {}",
                        response.error_text().unwrap_or_else(|| "pool returned false".into())
                    );
                    log::error!("{}", reason);
                    finish_handshake(&mut session, Err(reason));
                }
            }
            Some(PendingRequest::Submit { job_id }) => {
                if response.is_success() {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    log::info!("Share accepted (job {})", job_id);
                } else {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "Share rejected (job {}): {}",
                        job_id,
                        response.error_text().unwrap_or_else(|| "pool returned false".into())
                    );
                }
            }
            None => log::debug!("Response for unknown request id {}", response.id),
        }
    }

    /// Publishes job + target + extranonce as one snapshot
    fn publish(&self, session: &Session) {
        let (Some(job), Some(subscription)) = (&session.job, &session.subscription) else {
            return;
        };

        let target = match session.difficulty {
            Some(difficulty) => Target::from_difficulty(difficulty),
            None => job.bits_target(),
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                log::warn!("No usable target for job {}: {}", job.job_id, e);
                return;
            }
        };

        self.board.publish(WorkState {
            job: job.clone(),
            target,
            extranonce1: subscription.extranonce1.clone(),
            extranonce2_size: subscription.extranonce2_size,
            clean_epoch: self.board.clean_epoch(),
        });
    }
}

fn finish_handshake(session: &mut Session, outcome: Result<(), String>) {
    if let Some(tx) = session.handshake.take() {
        let _ = tx.send(outcome);
    }
}

/// Splits inbound bytes on `\n` without assuming UTF-8
fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_LENGTH)
}

async fn read_loop(
    inner: Arc<ClientInner>,
    generation: u64,
    mut reader: FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) => match std::str::from_utf8(&frame) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        inner.handle_line(generation, line);
                    }
                }
                Err(e) => log::warn!("Dropping pool message that is not UTF-8: {}", e),
            },
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                log::warn!("Dropping pool message longer than {} bytes", MAX_LINE_LENGTH);
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => {
                inner.link_lost(generation, &format!("read failed: {}", e));
                return;
            }
            None => {
                inner.link_lost(generation, "closed by pool");
                return;
            }
        }
    }
}

async fn write_loop(
    inner: Arc<ClientInner>,
    generation: u64,
    mut writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = outbound.recv() => line,
        };
        let Some(line) = line else { break };

        if let Err(e) = writer.send(line).await {
            inner.link_lost(generation, &format!("write failed: {}", e));
            return;
        }
    }
    let _ = SinkExt::<String>::close(&mut writer).await;
}
