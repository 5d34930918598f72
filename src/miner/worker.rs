// src/miner/worker.rs
//! Worker task implementation
//!
//! A worker scans its nonce range in blocks of [`HASHES_PER_BLOCK`] hashes.
//! Between blocks it yields to the runtime, applies the duty-cycle and
//! hashrate-cap sleeps, and re-reads both the work board and the control
//! table, so every setting change and clean job takes effect at the next
//! block boundary.

use crate::miner::algorithm::Algorithm;
use crate::miner::block::{self, HEADER_LEN};
use crate::miner::controller::{self, ControlCell, NonceRange, WorkerMeter};
use crate::miner::job::{self, Share, ShareSink, WorkBoard, WorkState};
use crate::stats::HashCounter;
use crate::utils::error::MinerError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Hashes computed between two yield points
pub const HASHES_PER_BLOCK: u64 = 1_000;

const FAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Handles shared by every worker of one mining session
#[derive(Clone)]
pub struct WorkerContext {
    /// Source of job snapshots
    pub board: Arc<WorkBoard>,
    /// Destination for found shares
    pub sink: Arc<dyn ShareSink>,
    /// Hash function for the configured algorithm
    pub algorithm: Arc<dyn Algorithm>,
    /// Session-wide hash counter feeding the stats reporter
    pub hashes: Arc<HashCounter>,
}

/// One header being scanned: a fixed extranonce2 over the worker's range
struct Attempt {
    work: Arc<WorkState>,
    range: NonceRange,
    extranonce2: Vec<u8>,
    header: [u8; HEADER_LEN],
    next_nonce: u64,
}

impl Attempt {
    fn new(work: Arc<WorkState>, range: NonceRange) -> Result<Self, MinerError> {
        let extranonce2 = job::generate_extranonce2(work.extranonce2_size);
        let header = work.job.header_template(&work.extranonce1, &extranonce2)?;
        Ok(Attempt {
            work,
            range,
            extranonce2,
            header,
            next_nonce: range.start,
        })
    }

    /// Same job and session: the header stays valid, only the target may move
    fn continues(&self, work: &WorkState, range: NonceRange) -> bool {
        self.range == range
            && self.work.clean_epoch == work.clean_epoch
            && Arc::ptr_eq(&self.work.job, &work.job)
            && self.work.extranonce1 == work.extranonce1
            && self.work.extranonce2_size == work.extranonce2_size
    }

    fn exhausted(&self) -> bool {
        self.next_nonce >= self.range.end
    }
}

struct BlockOutcome {
    hashes: u64,
    found: Vec<u32>,
}

/// A single hashing task
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    control: Arc<ControlCell>,
    meter: Arc<WorkerMeter>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        ctx: WorkerContext,
        control: Arc<ControlCell>,
        meter: Arc<WorkerMeter>,
        cancel: CancellationToken,
    ) -> Self {
        Worker {
            id,
            ctx,
            control,
            meter,
            cancel,
        }
    }

    /// Runs until cancelled
    ///
    /// Faults inside a block, panics included, are logged and the loop
    /// carries on with a fresh attempt.
    pub async fn run(self) {
        log::debug!("Worker {} started", self.id);

        if !self.ctx.algorithm.is_available() {
            log::warn!(
                "Worker {}: {} has no hashing backend in this build, idling",
                self.id,
                self.ctx.algorithm.algorithm_type()
            );
            self.cancel.cancelled().await;
            log::debug!("Worker {} stopped", self.id);
            return;
        }

        let mut control_rx = self.control.subscribe();
        let mut work_rx = self.ctx.board.subscribe();
        let mut attempt: Option<Attempt> = None;

        while !self.cancel.is_cancelled() {
            control_rx.borrow_and_update();
            let table = self.control.load();
            let range = match table.ranges.get(self.id) {
                Some(range) if !table.is_held() => *range,
                // paused, or retired and about to be cancelled
                _ => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        changed = control_rx.changed() => if changed.is_err() { break },
                    }
                    continue;
                }
            };

            work_rx.borrow_and_update();
            let Some(work) = self.ctx.board.snapshot() else {
                attempt = None;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = work_rx.changed() => if changed.is_err() { break },
                    _ = control_rx.changed() => {}
                }
                continue;
            };

            let reuse = attempt.as_ref().is_some_and(|a| a.continues(&work, range));
            if reuse {
                if let Some(current) = attempt.as_mut() {
                    current.work = work;
                }
            } else {
                match Attempt::new(work, range) {
                    Ok(fresh) => attempt = Some(fresh),
                    Err(e) => {
                        log::warn!("Worker {}: cannot build header: {}", self.id, e);
                        attempt = None;
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = work_rx.changed() => {}
                        }
                        continue;
                    }
                }
            }
            let Some(current) = attempt.as_mut() else { continue };

            if current.exhausted() {
                log::debug!(
                    "Worker {} exhausted its range on job {}, new extranonce2",
                    self.id,
                    current.work.job.job_id
                );
                match Attempt::new(current.work.clone(), range) {
                    Ok(fresh) => *current = fresh,
                    Err(e) => {
                        log::warn!("Worker {}: cannot build header: {}", self.id, e);
                        attempt = None;
                        continue;
                    }
                }
            }

            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.hash_block(current)));
            let active = started.elapsed();

            match outcome {
                Ok(Ok(block)) => {
                    self.meter.record(block.hashes, active);
                    self.ctx.hashes.add(block.hashes);
                    for nonce in block.found {
                        self.submit(current, nonce);
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Worker {}: hashing failed: {}", self.id, e);
                    attempt = None;
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    log::error!("Worker {}: recovered from a panic while hashing", self.id);
                    attempt = None;
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            }

            tokio::task::yield_now().await;

            let pause = table.cap_delay + controller::duty_sleep(active, table.duty_cycle(self.id));
            if !pause.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = time::sleep(pause) => {}
                }
            }
        }

        log::debug!("Worker {} stopped", self.id);
    }

    /// Hashes up to one block of nonces from the attempt's cursor
    fn hash_block(&self, attempt: &mut Attempt) -> Result<BlockOutcome, MinerError> {
        let start = attempt.next_nonce;
        let end = (start + HASHES_PER_BLOCK).min(attempt.range.end);
        let mut header = attempt.header;
        let mut found = Vec::new();

        for nonce in start..end {
            // ranges never exceed 2^32
            let nonce = nonce as u32;
            block::set_header_nonce(&mut header, nonce);
            let hash = self.ctx.algorithm.digest(&header)?;
            if attempt.work.target.is_met_by(&hash) {
                found.push(nonce);
            }
        }

        attempt.next_nonce = end;
        Ok(BlockOutcome {
            hashes: end - start,
            found,
        })
    }

    fn submit(&self, attempt: &Attempt, nonce: u32) {
        if attempt.work.clean_epoch != self.ctx.board.clean_epoch() {
            log::debug!(
                "Worker {}: discarding share for replaced job {}",
                self.id,
                attempt.work.job.job_id
            );
            return;
        }

        let share = Share {
            job_id: attempt.work.job.job_id.clone(),
            extranonce2: hex::encode(&attempt.extranonce2),
            time: attempt.work.job.time.clone(),
            nonce,
            clean_epoch: attempt.work.clean_epoch,
        };
        log::debug!(
            "Worker {} found share for job {} (nonce {})",
            self.id,
            share.job_id,
            share.nonce_hex()
        );
        if let Err(e) = self.ctx.sink.submit(share) {
            log::warn!("Worker {}: share not submitted: {}", self.id, e);
        }
    }

    /// Sleeps after a fault; true if cancelled meanwhile
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = time::sleep(FAULT_BACKOFF) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::algorithm;
    use crate::miner::block::{Target, sha256d};
    use crate::miner::controller::ResourceController;
    use crate::miner::job::tests::sample_job;
    use crate::types::AlgorithmType;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Records shares along with the board epoch seen at submission
    struct RecordingSink {
        board: Arc<WorkBoard>,
        shares: Mutex<Vec<(Share, u64)>>,
    }

    impl ShareSink for RecordingSink {
        fn submit(&self, share: Share) -> Result<(), MinerError> {
            let epoch = self.board.clean_epoch();
            self.shares.lock().push((share, epoch));
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Fault {
        Panic,
        Error,
    }

    /// sha256d that misbehaves on selected digest calls
    struct FlakyAlgorithm {
        fault: Fault,
        at: Vec<u64>,
        calls: AtomicU64,
        faults: AtomicU64,
    }

    impl FlakyAlgorithm {
        fn new(fault: Fault, at: Vec<u64>) -> Self {
            FlakyAlgorithm {
                fault,
                at,
                calls: AtomicU64::new(0),
                faults: AtomicU64::new(0),
            }
        }

        fn faults(&self) -> u64 {
            self.faults.load(Ordering::Relaxed)
        }
    }

    impl Algorithm for FlakyAlgorithm {
        fn digest(&self, input: &[u8]) -> Result<[u8; 32], MinerError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if self.at.contains(&call) {
                self.faults.fetch_add(1, Ordering::Relaxed);
                match self.fault {
                    Fault::Panic => panic!("digest blew up on call {}", call),
                    Fault::Error => {
                        return Err(MinerError::AlgorithmError(format!("digest failed on call {}", call)));
                    }
                }
            }
            Ok(sha256d(input))
        }

        fn algorithm_type(&self) -> AlgorithmType {
            AlgorithmType::Sha256d
        }
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        let waited = time::timeout(Duration::from_secs(5), async {
            while !check() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    /// Runs one worker on `flaky` and checks hashing resumes after its faults
    async fn keeps_hashing_through(flaky: Arc<FlakyAlgorithm>, expected_faults: u64) {
        let (mut ctx, _, hashes) = session(AlgorithmType::Sha256d);
        ctx.algorithm = flaky.clone();
        let board = ctx.board.clone();
        let epoch = board.begin_clean_epoch();
        board.publish(work("j1", epoch));

        let controller = ResourceController::new();
        controller.start(ctx, 1, 100).unwrap();

        wait_until("the injected faults", || flaky.faults() >= expected_faults).await;
        let after_faults = hashes.total();
        wait_until("hashing to resume", || hashes.total() >= after_faults + 2 * HASHES_PER_BLOCK).await;
        controller.stop().await;

        assert_eq!(flaky.faults(), expected_faults);
        assert_eq!(controller.worker_count(), 0);
    }

    fn work(job_id: &str, epoch: u64) -> WorkState {
        // roughly one hash in 256 qualifies
        let mut target = [0xff; 32];
        target[0] = 0;
        WorkState {
            job: Arc::new(sample_job(job_id, true)),
            target: Target::from_bytes(target),
            extranonce1: vec![0xaa, 0xbb, 0xcc, 0xdd],
            extranonce2_size: 4,
            clean_epoch: epoch,
        }
    }

    fn session(algo: AlgorithmType) -> (WorkerContext, Arc<RecordingSink>, Arc<HashCounter>) {
        let board = Arc::new(WorkBoard::new());
        let sink = Arc::new(RecordingSink {
            board: board.clone(),
            shares: Mutex::new(Vec::new()),
        });
        let hashes = Arc::new(HashCounter::default());
        let ctx = WorkerContext {
            board,
            sink: sink.clone(),
            algorithm: algorithm::create(algo),
            hashes: hashes.clone(),
        };
        (ctx, sink, hashes)
    }

    #[tokio::test]
    async fn shares_meet_target_and_stay_in_range() {
        let (ctx, sink, hashes) = session(AlgorithmType::Sha256d);
        let board = ctx.board.clone();
        let epoch = board.begin_clean_epoch();
        board.publish(work("j1", epoch));

        let controller = ResourceController::new();
        controller.start(ctx, 2, 100).unwrap();
        time::sleep(Duration::from_millis(300)).await;
        controller.stop().await;

        assert!(hashes.total() > 0);
        let shares = sink.shares.lock();
        assert!(!shares.is_empty());

        let ranges = controller::partition_nonces(2);
        let job = sample_job("j1", true);
        for (share, _) in shares.iter() {
            assert_eq!(share.job_id, "j1");
            assert_eq!(share.extranonce2.len(), 8);
            assert!(ranges.iter().any(|r| (r.start..r.end).contains(&u64::from(share.nonce))));

            let extranonce2 = hex::decode(&share.extranonce2).unwrap();
            let mut header = job
                .header_template(&[0xaa, 0xbb, 0xcc, 0xdd], &extranonce2)
                .unwrap();
            block::set_header_nonce(&mut header, share.nonce);
            assert_eq!(sha256d(&header)[0], 0);
        }
    }

    #[tokio::test]
    async fn clean_job_stops_shares_for_old_job() {
        let (ctx, sink, _) = session(AlgorithmType::Sha256d);
        let board = ctx.board.clone();
        let first = board.begin_clean_epoch();
        board.publish(work("j1", first));

        let controller = ResourceController::new();
        controller.start(ctx, 2, 100).unwrap();
        time::sleep(Duration::from_millis(150)).await;

        let second = board.begin_clean_epoch();
        board.publish(work("j2", second));
        time::sleep(Duration::from_millis(150)).await;
        controller.stop().await;

        let shares = sink.shares.lock();
        for (share, epoch_at_submit) in shares.iter() {
            assert_eq!(share.clean_epoch, *epoch_at_submit, "stale share for {}", share.job_id);
        }
        assert!(shares.iter().any(|(s, _)| s.job_id == "j2"));
    }

    #[tokio::test]
    async fn unavailable_algorithm_idles_with_zero_throughput() {
        let (ctx, sink, hashes) = session(AlgorithmType::RandomX);
        let board = ctx.board.clone();
        let epoch = board.begin_clean_epoch();
        board.publish(work("j1", epoch));

        let controller = ResourceController::new();
        controller.start(ctx, 2, 100).unwrap();
        time::sleep(Duration::from_millis(100)).await;
        controller.stop().await;

        assert_eq!(hashes.total(), 0);
        assert!(sink.shares.lock().is_empty());
    }

    #[tokio::test]
    async fn waits_for_first_job() {
        let (ctx, _, hashes) = session(AlgorithmType::Blake3);
        let board = ctx.board.clone();

        let controller = ResourceController::new();
        controller.start(ctx, 1, 100).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hashes.total(), 0);

        let epoch = board.begin_clean_epoch();
        board.publish(work("j1", epoch));
        time::sleep(Duration::from_millis(100)).await;
        assert!(hashes.total() > 0);
        controller.stop().await;
    }

    #[tokio::test]
    async fn range_exhaustion_rolls_extranonce2() {
        let (ctx, sink, _) = session(AlgorithmType::Sha256d);
        let board = ctx.board.clone();
        let epoch = board.begin_clean_epoch();
        board.publish(work("j1", epoch));

        let meter = Arc::new(WorkerMeter::default());
        let control = Arc::new(ControlCell::default());
        let worker = Worker::new(0, ctx, control, meter, CancellationToken::new());

        let tiny = NonceRange { start: 0, end: 1500 };
        let mut attempt = Attempt::new(board.snapshot().unwrap(), tiny).unwrap();
        let first = worker.hash_block(&mut attempt).unwrap();
        assert_eq!(first.hashes, 1000);
        let second = worker.hash_block(&mut attempt).unwrap();
        assert_eq!(second.hashes, 500);
        assert!(attempt.exhausted());

        let rolled = Attempt::new(attempt.work.clone(), tiny).unwrap();
        assert_eq!(rolled.next_nonce, 0);
        assert_eq!(rolled.extranonce2.len(), 4);
        assert!(sink.shares.lock().is_empty());
    }

    #[tokio::test]
    async fn worker_survives_panicking_algorithm() {
        keeps_hashing_through(Arc::new(FlakyAlgorithm::new(Fault::Panic, vec![1_500])), 1).await;
    }

    #[tokio::test]
    async fn worker_survives_failing_algorithm() {
        let flaky = Arc::new(FlakyAlgorithm::new(Fault::Error, vec![1_500, 1_501, 1_502]));
        keeps_hashing_through(flaky, 3).await;
    }
}
