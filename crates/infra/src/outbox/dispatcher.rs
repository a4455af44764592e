//! Outbox dispatcher loop.
//!
//! Each cycle:
//!
//! 1. resets records stuck in `processing` past the orphan threshold,
//! 2. claims a batch of due records (the claim commits on its own),
//! 3. before each send, renews the lease on every record of the batch it still
//!    holds and drops any record whose lease was lost,
//! 4. sends the record under a per-item timeout with a child cancellation
//!    scope of the loop's shutdown token,
//! 5. persists every outcome in one batch write, guarded by the lease stamp.
//!
//! Renewing the whole batch keeps records waiting for their send, or for the
//! final outcome write, from looking orphaned while other sends run, so the
//! orphan threshold only has to exceed one send timeout.
//!
//! A failing item is retried with backoff and never aborts the batch. Only
//! shutdown ends a cycle early: items already sent keep their outcome, the
//! rest of the batch is released back to `pending` without counting an attempt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use homefix_core::{Clock, OutboxId};
use homefix_notify::{OutboxRecord, OutboxStatus, RetryPolicy};

use super::sender::{SendError, Sender};
use crate::store::{Store, StoreError};
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub send_timeout: Duration,
    /// Records in `processing` for longer than this are considered orphaned.
    pub orphan_threshold: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 20,
            send_timeout: Duration::from_secs(30),
            orphan_threshold: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Shutdown was requested mid-cycle. Outcomes were persisted first.
    #[error("dispatch cycle cancelled")]
    Cancelled,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub recovered: u64,
    pub claimed: usize,
    pub sent: usize,
    /// Failed attempts rescheduled with backoff.
    pub retried: usize,
    /// Records that exhausted their attempts.
    pub failed: usize,
    /// Claimed records handed back unattempted.
    pub released: usize,
    /// Claimed records another dispatcher took over; neither sent nor saved.
    pub lost: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.claimed == 0
    }
}

/// Runtime counters of a running dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub recovered: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl DispatcherStats {
    fn record(&mut self, report: &CycleReport, at: DateTime<Utc>) {
        self.cycles += 1;
        self.recovered += report.recovered;
        self.sent += report.sent as u64;
        self.retried += report.retried as u64;
        self.failed += report.failed as u64;
        self.last_cycle_at = Some(at);
    }
}

enum Delivery {
    Sent,
    Failed(String),
    /// Shutdown fired while the send was in flight.
    Interrupted,
}

pub struct OutboxDispatcher<S, T> {
    store: S,
    sender: T,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl<S, T> OutboxDispatcher<S, T>
where
    S: Store,
    T: Sender + 'static,
{
    pub fn new(store: S, sender: T, clock: Arc<dyn Clock>, config: DispatcherConfig) -> Self {
        Self {
            store,
            sender,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one recover / claim / send / persist cycle.
    pub async fn run_cycle(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, DispatchError> {
        if shutdown.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.orphan_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let recovered = self.store.recover_orphans(now - threshold, now).await?;
        if recovered > 0 {
            warn!(recovered, "reset orphaned outbox records");
        }

        let claimed = self
            .store
            .claim_outbox(self.config.batch_size, self.clock.now())
            .await?;
        let mut report = CycleReport {
            recovered,
            claimed: claimed.len(),
            ..CycleReport::default()
        };

        let mut batch: Vec<(OutboxRecord, DateTime<Utc>)> = claimed
            .into_iter()
            .map(|record| {
                let lease = record.updated_at;
                (record, lease)
            })
            .collect();
        let mut held = vec![true; batch.len()];

        let mut interrupted = false;
        for index in 0..batch.len() {
            if !held[index] {
                continue;
            }
            if interrupted || shutdown.is_cancelled() {
                interrupted = true;
                batch[index].0.release(self.clock.now());
                report.released += 1;
                continue;
            }

            report.lost += self.renew_leases(&mut batch, &mut held).await?;
            if !held[index] {
                continue;
            }

            let record = &mut batch[index].0;
            match self.deliver(record, shutdown).await {
                Delivery::Sent => {
                    record.mark_sent(self.clock.now());
                    report.sent += 1;
                    debug!(
                        outbox_id = %record.id,
                        job_id = ?record.job_id,
                        attempts = record.attempts,
                        "outbox record sent"
                    );
                }
                Delivery::Failed(reason) => {
                    record.record_failure(&self.config.retry, reason, self.clock.now());
                    if record.status == OutboxStatus::Failed {
                        report.failed += 1;
                    } else {
                        report.retried += 1;
                    }
                    warn!(
                        outbox_id = %record.id,
                        job_id = ?record.job_id,
                        attempts = record.attempts,
                        status = record.status.as_str(),
                        next_retry_at = ?record.next_retry_at,
                        error = record.last_error.as_deref().unwrap_or_default(),
                        "outbox delivery failed"
                    );
                }
                Delivery::Interrupted => {
                    interrupted = true;
                    record.release(self.clock.now());
                    report.released += 1;
                }
            }
        }

        let outcomes: Vec<(OutboxRecord, DateTime<Utc>)> = batch
            .into_iter()
            .zip(held)
            .filter_map(|(leased, held)| held.then_some(leased))
            .collect();
        self.store.save_outbox_outcomes(&outcomes).await?;

        if interrupted {
            info!(
                sent = report.sent,
                released = report.released,
                "dispatch cycle interrupted by shutdown"
            );
            return Err(DispatchError::Cancelled);
        }
        Ok(report)
    }

    /// Extend the lease of every still-held record in the batch. Returns how many
    /// were lost to another dispatcher since the last renewal.
    async fn renew_leases(
        &self,
        batch: &mut [(OutboxRecord, DateTime<Utc>)],
        held: &mut [bool],
    ) -> Result<usize, StoreError> {
        let leases: Vec<(OutboxId, DateTime<Utc>)> = batch
            .iter()
            .zip(held.iter())
            .filter(|(_, held)| **held)
            .map(|((record, lease), _)| (record.id, *lease))
            .collect();
        let renewed = self
            .store
            .renew_outbox_leases(&leases, self.clock.now())
            .await?;

        let mut lost = 0;
        for ((record, lease), held) in batch.iter_mut().zip(held.iter_mut()) {
            if !*held {
                continue;
            }
            match renewed.iter().find(|(id, _)| *id == record.id) {
                Some((_, stamp)) => *lease = *stamp,
                None => {
                    *held = false;
                    lost += 1;
                    warn!(
                        outbox_id = %record.id,
                        "outbox lease lost; record taken over by another dispatcher"
                    );
                }
            }
        }
        Ok(lost)
    }

    async fn deliver(&self, record: &OutboxRecord, shutdown: &CancellationToken) -> Delivery {
        let scope = shutdown.child_token();
        let send = tokio::time::timeout(
            self.config.send_timeout,
            self.sender.send(record, scope.clone()),
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Delivery::Interrupted,
            outcome = send => match outcome {
                Ok(Ok(true)) => Delivery::Sent,
                Ok(Ok(false)) => Delivery::Failed("sender declined the message".to_string()),
                Ok(Err(SendError::Cancelled)) if shutdown.is_cancelled() => Delivery::Interrupted,
                Ok(Err(err)) => Delivery::Failed(err.to_string()),
                Err(_) => {
                    scope.cancel();
                    Delivery::Failed(format!(
                        "send timed out after {}s",
                        self.config.send_timeout.as_secs()
                    ))
                }
            },
        }
    }

    /// Start the polling loop on the current runtime. The loop stops when
    /// `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> WorkerHandle<DispatcherStats> {
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let join = tokio::spawn({
            let stats = Arc::clone(&stats);
            let shutdown = shutdown.clone();
            async move { self.run(shutdown, stats).await }
        });
        WorkerHandle::new("outbox-dispatcher", shutdown, join, stats)
    }

    async fn run(self, shutdown: CancellationToken, stats: Arc<Mutex<DispatcherStats>>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );

        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    stats
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .record(&report, self.clock.now());
                    if !report.is_idle() {
                        info!(
                            recovered = report.recovered,
                            claimed = report.claimed,
                            sent = report.sent,
                            retried = report.retried,
                            failed = report.failed,
                            lost = report.lost,
                            "dispatch cycle complete"
                        );
                    }
                }
                Err(DispatchError::Cancelled) => break,
                Err(DispatchError::Store(err)) => {
                    stats.lock().unwrap_or_else(|p| p.into_inner()).cycle_errors += 1;
                    error!(error = %err, "dispatch cycle failed");
                }
            }
        }

        info!("outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use homefix_core::{ManualClock, NotificationId};
    use homefix_notify::OutboxMessage;
    use tokio::sync::Notify;

    use crate::store::InMemoryStore;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Deliver,
        Fail,
        Decline,
        Hang,
    }

    /// Plays back a fixed script of outcomes, then delivers.
    #[derive(Default)]
    struct ScriptedSender {
        script: Mutex<VecDeque<Step>>,
        /// Cancelled right after the first send completes.
        stop_after_first: Option<CancellationToken>,
        calls: Mutex<usize>,
    }

    impl ScriptedSender {
        fn with(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                script: Mutex::new(steps.into_iter().collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn send(
            &self,
            _record: &OutboxRecord,
            cancel: CancellationToken,
        ) -> Result<bool, SendError> {
            *self.calls.lock().unwrap() += 1;
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Deliver);
            if let Some(token) = &self.stop_after_first {
                token.cancel();
            }
            match step {
                Step::Deliver => Ok(true),
                Step::Decline => Ok(false),
                Step::Fail => Err(SendError::Transport("smtp 451".into())),
                Step::Hang => {
                    cancel.cancelled().await;
                    Err(SendError::Cancelled)
                }
            }
        }
    }

    /// Delivers every message, moving the clock forward by `pace` per send and
    /// pausing mid-send until the test lets it finish.
    struct PacedSender {
        clock: ManualClock,
        pace: ChronoDuration,
        started: Notify,
        resume: Notify,
        calls: Mutex<usize>,
    }

    impl PacedSender {
        fn new(clock: &ManualClock, pace: ChronoDuration) -> Self {
            Self {
                clock: clock.clone(),
                pace,
                started: Notify::new(),
                resume: Notify::new(),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Sender for PacedSender {
        async fn send(
            &self,
            _record: &OutboxRecord,
            _cancel: CancellationToken,
        ) -> Result<bool, SendError> {
            *self.calls.lock().unwrap() += 1;
            self.clock.advance(self.pace);
            self.started.notify_one();
            self.resume.notified().await;
            Ok(true)
        }
    }

    struct Fixture {
        store: InMemoryStore,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryStore::new(),
                clock: ManualClock::new(Utc::now()),
            }
        }

        fn seed(&self) -> OutboxRecord {
            let record = OutboxRecord::pending(
                OutboxMessage::email("cara@example.com", "subject", "body")
                    .with_notification(NotificationId::new()),
                self.clock.now(),
            );
            self.store.put_outbox_record(record.clone()).unwrap();
            record
        }

        fn dispatcher(
            &self,
            sender: Arc<ScriptedSender>,
        ) -> OutboxDispatcher<InMemoryStore, Arc<ScriptedSender>> {
            OutboxDispatcher::new(
                self.store.clone(),
                sender,
                Arc::new(self.clock.clone()),
                DispatcherConfig::default(),
            )
        }

        fn dispatcher_with<T: Sender + 'static>(
            &self,
            sender: T,
            config: DispatcherConfig,
        ) -> OutboxDispatcher<InMemoryStore, T> {
            OutboxDispatcher::new(
                self.store.clone(),
                sender,
                Arc::new(self.clock.clone()),
                config,
            )
        }

        async fn record(&self, id: homefix_core::OutboxId) -> OutboxRecord {
            self.store.outbox_record(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn successful_send_marks_sent() {
        let fx = Fixture::new();
        let seeded = fx.seed();
        let dispatcher = fx.dispatcher(Arc::new(ScriptedSender::default()));

        let report = dispatcher.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!((report.claimed, report.sent), (1, 1));
        let stored = fx.record(seeded.id).await;
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.sent_at, Some(fx.clock.now()));
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn failures_back_off_then_give_up() {
        let fx = Fixture::new();
        let seeded = fx.seed();
        let sender = Arc::new(ScriptedSender::with([Step::Fail; 4]));
        let dispatcher = fx.dispatcher(Arc::clone(&sender));
        let shutdown = CancellationToken::new();

        for (attempt, delay) in [(1, 10), (2, 20), (3, 40)] {
            let report = dispatcher.run_cycle(&shutdown).await.unwrap();
            assert_eq!(report.retried, 1);

            let stored = fx.record(seeded.id).await;
            assert_eq!(stored.status, OutboxStatus::Pending);
            assert_eq!(stored.attempts, attempt);
            let expected = fx.clock.now() + ChronoDuration::seconds(delay);
            assert_eq!(stored.next_retry_at, Some(expected));

            // Not due yet.
            fx.clock.advance(ChronoDuration::seconds(delay - 1));
            let idle = dispatcher.run_cycle(&shutdown).await.unwrap();
            assert_eq!(idle.claimed, 0);
            fx.clock.advance(ChronoDuration::seconds(1));
        }

        let report = dispatcher.run_cycle(&shutdown).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = fx.record(seeded.id).await;
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.attempts, 4);
        assert_eq!(stored.next_retry_at, None);
        assert_eq!(stored.last_error.as_deref(), Some("transport error: smtp 451"));

        fx.clock.advance(ChronoDuration::hours(2));
        assert_eq!(dispatcher.run_cycle(&shutdown).await.unwrap().claimed, 0);
        assert_eq!(sender.calls(), 4);
    }

    #[tokio::test]
    async fn one_bad_item_does_not_abort_the_batch() {
        let fx = Fixture::new();
        let first = fx.seed();
        fx.clock.advance(ChronoDuration::seconds(1));
        let second = fx.seed();
        let dispatcher = fx.dispatcher(Arc::new(ScriptedSender::with([Step::Decline])));

        let report = dispatcher.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!((report.sent, report.retried), (1, 1));
        assert_eq!(fx.record(first.id).await.status, OutboxStatus::Pending);
        assert_eq!(fx.record(first.id).await.attempts, 1);
        assert_eq!(fx.record(second.id).await.status, OutboxStatus::Sent);
    }

    #[tokio::test]
    async fn orphaned_records_are_recovered_and_resent() {
        let fx = Fixture::new();
        let mut stuck = OutboxRecord::pending(
            OutboxMessage::email("ops@example.com", "s", "b"),
            fx.clock.now(),
        );
        stuck.attempts = 2;
        stuck.next_retry_at = Some(fx.clock.now() + ChronoDuration::hours(1));
        stuck.mark_processing(fx.clock.now());
        fx.store.put_outbox_record(stuck.clone()).unwrap();

        let dispatcher = fx.dispatcher(Arc::new(ScriptedSender::default()));
        let shutdown = CancellationToken::new();

        fx.clock.advance(ChronoDuration::minutes(4));
        let report = dispatcher.run_cycle(&shutdown).await.unwrap();
        assert_eq!((report.recovered, report.claimed), (0, 0));

        fx.clock.advance(ChronoDuration::minutes(2));
        let report = dispatcher.run_cycle(&shutdown).await.unwrap();
        assert_eq!((report.recovered, report.sent), (1, 1));
        assert_eq!(fx.record(stuck.id).await.status, OutboxStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out_and_is_retried() {
        let fx = Fixture::new();
        let seeded = fx.seed();
        let dispatcher = fx.dispatcher(Arc::new(ScriptedSender::with([Step::Hang])));

        let report = dispatcher.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.retried, 1);
        let stored = fx.record(seeded.id).await;
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("send timed out after 30s"));
    }

    #[tokio::test]
    async fn shutdown_mid_batch_releases_unattempted_records() {
        let fx = Fixture::new();
        let first = fx.seed();
        fx.clock.advance(ChronoDuration::seconds(1));
        let second = fx.seed();

        let shutdown = CancellationToken::new();
        let sender = Arc::new(ScriptedSender {
            stop_after_first: Some(shutdown.clone()),
            ..ScriptedSender::default()
        });
        let dispatcher = fx.dispatcher(Arc::clone(&sender));

        let outcome = dispatcher.run_cycle(&shutdown).await;

        assert_eq!(outcome, Err(DispatchError::Cancelled));
        assert_eq!(sender.calls(), 1);
        let released = fx.record(second.id).await;
        assert_eq!(released.status, OutboxStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert_ne!(fx.record(first.id).await.status, OutboxStatus::Processing);
    }

    fn tight_leases() -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 3,
            send_timeout: Duration::from_secs(50),
            orphan_threshold: Duration::from_secs(60),
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn long_batch_keeps_its_records_away_from_a_second_dispatcher() {
        let fx = Fixture::new();
        let seeded: Vec<OutboxRecord> = (0..3)
            .map(|_| {
                let record = fx.seed();
                fx.clock.advance(ChronoDuration::seconds(1));
                record
            })
            .collect();

        // Each send takes 40s, so the batch outlives the 60s orphan threshold.
        let slow = Arc::new(PacedSender::new(&fx.clock, ChronoDuration::seconds(40)));
        let other = Arc::new(ScriptedSender::default());
        let first = fx.dispatcher_with(Arc::clone(&slow), tight_leases());
        let second = fx.dispatcher_with(Arc::clone(&other), tight_leases());
        let shutdown = CancellationToken::new();

        let rival = async {
            for _ in 0..seeded.len() {
                slow.started.notified().await;
                let report = second.run_cycle(&shutdown).await.unwrap();
                assert_eq!((report.recovered, report.claimed), (0, 0));
                slow.resume.notify_one();
            }
        };
        let (report, ()) = tokio::join!(first.run_cycle(&shutdown), rival);

        let report = report.unwrap();
        assert_eq!((report.sent, report.lost), (3, 0));
        assert_eq!(slow.calls(), 3);
        assert_eq!(other.calls(), 0);
        for record in &seeded {
            assert_eq!(fx.record(record.id).await.status, OutboxStatus::Sent);
        }
    }

    #[tokio::test]
    async fn stalled_dispatcher_leaves_taken_over_records_alone() {
        let fx = Fixture::new();
        let first_record = fx.seed();
        fx.clock.advance(ChronoDuration::seconds(1));
        let second_record = fx.seed();

        // One send stalls far past the orphan threshold.
        let stalled = Arc::new(PacedSender::new(&fx.clock, ChronoDuration::minutes(10)));
        let other = Arc::new(ScriptedSender::default());
        let first = fx.dispatcher_with(Arc::clone(&stalled), tight_leases());
        let second = fx.dispatcher_with(Arc::clone(&other), tight_leases());
        let shutdown = CancellationToken::new();

        let rival = async {
            stalled.started.notified().await;
            let report = second.run_cycle(&shutdown).await.unwrap();
            assert_eq!((report.recovered, report.sent), (2, 2));
            stalled.resume.notify_one();
        };
        let (report, ()) = tokio::join!(first.run_cycle(&shutdown), rival);

        let report = report.unwrap();
        assert_eq!(stalled.calls(), 1);
        assert_eq!(other.calls(), 2);
        assert_eq!(report.lost, 2);
        for id in [first_record.id, second_record.id] {
            let stored = fx.record(id).await;
            assert_eq!(stored.status, OutboxStatus::Sent);
            assert_eq!(stored.attempts, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_dispatches_and_stops_on_shutdown() {
        let fx = Fixture::new();
        let seeded = fx.seed();
        let handle = fx
            .dispatcher(Arc::new(ScriptedSender::default()))
            .spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = handle.shutdown().await;

        assert!(stats.cycles >= 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(fx.record(seeded.id).await.status, OutboxStatus::Sent);
    }
}
