//! Delivery engine: retry worker orchestration and the operator surface.
//!
//! The engine is an explicitly constructed service object holding its own
//! client, stores, policy, and time sources; hosts construct one per message
//! category and pass it around by reference. There is no module-global
//! instance.
//!
//! Flow: a failed send enters at [`DeliveryEngine::handle_failure`], waits in
//! the retry store until due, and is picked up by [`DeliveryEngine::sweep`]
//! (called periodically by [`DeliveryEngine::run`]). Each due record goes
//! through one worker attempt: send under a timeout, classify the outcome,
//! then finalize success, reschedule with backoff, or escalate to the dead
//! letter store. Send client errors never escape the engine; only storage
//! errors do.
//!
//! Delivery is at-least-once: a crash between a successful send and the
//! record removal replays the send on restart. Exactly-once would need
//! idempotency keys on the provider side.

use crate::backoff::RetryPolicy;
use crate::classify::{classify, Classification};
use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::message::{DeadLetterRecord, FailedSend, Outcome, RetryKey, RetryRecord};
use crate::metrics::{MetricsAggregator, RetryStats};
use crate::send::{SendClient, SendError, SendRequest};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{DeadLetterStore, MemoryDeadLetterStore, MemoryRetryStore, RetryStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Error text recorded on records re-injected by operator replay.
const MANUAL_RETRY_ERROR: &str = "manual retry requested by operator";

/// How many times a failed dead-letter append is retried before giving up.
const DEAD_LETTER_APPEND_ATTEMPTS: u32 = 3;

/// Outcome of accepting a failed send into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// A retry was scheduled (or collapsed into an existing record).
    Scheduled { next_retry_at: u64 },
    /// The failure was terminal; the message went straight to the DLQ.
    DeadLettered { id: u64 },
}

/// Outcome of one worker attempt on a due record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The send succeeded on the given attempt number.
    Delivered { attempt: u32 },
    /// Retryable failure under the cap; next attempt scheduled.
    Rescheduled { attempt: u32, next_retry_at: u64 },
    /// Permanent failure or attempts exhausted; record moved to the DLQ.
    DeadLettered { attempt: u32, id: u64 },
}

/// Counters for one sweep over due records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Attempts abandoned because storage failed mid-transition. Logged at
    /// error severity as they happen.
    pub storage_errors: usize,
}

/// Result of an operator replay request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Ids re-injected as fresh retries.
    pub replayed: Vec<u64>,
    /// Ids not found (already replayed or never written).
    pub missing: Vec<u64>,
}

/// Errors produced while building an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `worker_concurrency` must be > 0.
    ZeroConcurrency,
    /// `send_timeout` must be non-zero.
    ZeroSendTimeout,
    /// `poll_interval` must be non-zero.
    ZeroPollInterval,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::ZeroConcurrency => write!(f, "worker_concurrency must be > 0"),
            BuildError::ZeroSendTimeout => write!(f, "send_timeout must be non-zero"),
            BuildError::ZeroPollInterval => write!(f, "poll_interval must be non-zero"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Reliable delivery engine. See the module docs for the overall flow.
pub struct DeliveryEngine {
    client: Arc<dyn SendClient>,
    retry_store: Arc<dyn RetryStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricsAggregator>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    send_timeout: Duration,
    poll_interval: Duration,
    workers: Arc<Semaphore>,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("policy", &self.policy)
            .field("send_timeout", &self.send_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Construct a new builder around a send client.
    pub fn builder(client: Arc<dyn SendClient>) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder::new(client)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Accept a failed send into the engine.
    ///
    /// Permanent failures dead-letter immediately; no retry record is ever
    /// created for them, and any retry already pending for the key is
    /// dropped. Retryable (and unclassified) failures are stored as
    /// attempt 1 with a jittered backoff timer. A second failure for the same
    /// (recipient, message type) collapses into the existing record.
    pub async fn handle_failure(
        &self,
        failed: FailedSend,
    ) -> Result<FailureDisposition, EngineError> {
        let now = self.clock.now_millis();
        let key = failed.key();

        let permanent = classify(&failed.error) == Classification::Permanent;
        // First failure is attempt 1; a 1-attempt policy exhausts right here.
        if permanent || 1 >= self.policy.max_attempts() {
            let id = self
                .append_dead_letter(
                    &key,
                    DeadLetterRecord {
                        id: 0,
                        recipient: failed.recipient,
                        recipient_user_id: failed.recipient_user_id,
                        subject: failed.subject,
                        message_type: failed.message_type,
                        payload: failed.payload,
                        tags: failed.tags,
                        final_error: failed.error.to_string(),
                        failed_at: now,
                        created_at: now,
                    },
                )
                .await?;
            // A permanent verdict supersedes any retry already pending for
            // this key; the message must not sit in both queues.
            self.retry_store.remove(&key).await?;
            self.metrics.record(Outcome::Failed, 1, now);
            tracing::error!(key = %key, id, error = %failed.error, "message dead lettered");
            return Ok(FailureDisposition::DeadLettered { id });
        }

        let next_retry_at = now + self.policy.next_delay(1).as_millis() as u64;
        let record = RetryRecord {
            recipient: failed.recipient,
            recipient_user_id: failed.recipient_user_id,
            subject: failed.subject,
            message_type: failed.message_type,
            payload: failed.payload,
            tags: failed.tags,
            attempt_count: 1,
            last_error: failed.error.to_string(),
            next_retry_at,
            original_send_time: failed.original_send_time,
            created_at: now,
            updated_at: now,
        };
        self.retry_store.upsert(record).await?;
        tracing::warn!(
            key = %key,
            error = %failed.error,
            next_retry_at,
            "send failed; retry scheduled"
        );
        Ok(FailureDisposition::Scheduled { next_retry_at })
    }

    /// Run one worker attempt for a due record.
    pub async fn process_record(&self, record: RetryRecord) -> Result<AttemptOutcome, EngineError> {
        let key = record.key();
        let attempt = record.attempt_count + 1;

        let mut tags = record.tags.clone();
        tags.insert("attempt".into(), attempt.to_string());
        let request = SendRequest {
            recipient: record.recipient.clone(),
            subject: record.subject.clone(),
            message_type: record.message_type.clone(),
            payload: record.payload.clone(),
            tags,
        };

        // The send call is the only operation allowed to block; a hung client
        // is cut off and treated as a retryable timeout.
        let result = match tokio::time::timeout(self.send_timeout, self.client.send(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::timed_out(self.send_timeout)),
        };

        let now = self.clock.now_millis();
        match result {
            Ok(()) => {
                self.retry_store.remove(&key).await?;
                self.metrics.record(Outcome::Success, attempt, now);
                tracing::info!(key = %key, attempt, "delivered after retry");
                Ok(AttemptOutcome::Delivered { attempt })
            }
            Err(error) => {
                let terminal = classify(&error) == Classification::Permanent
                    || attempt >= self.policy.max_attempts();
                self.metrics.record(Outcome::Failed, attempt, now);

                if terminal {
                    let id = self
                        .append_dead_letter(
                            &key,
                            DeadLetterRecord {
                                id: 0,
                                recipient: record.recipient,
                                recipient_user_id: record.recipient_user_id,
                                subject: record.subject,
                                message_type: record.message_type,
                                payload: record.payload,
                                tags: record.tags,
                                final_error: error.to_string(),
                                failed_at: now,
                                created_at: now,
                            },
                        )
                        .await?;
                    self.retry_store.remove(&key).await?;
                    tracing::error!(
                        key = %key,
                        attempt,
                        id,
                        error = %error,
                        "retries exhausted; message dead lettered"
                    );
                    Ok(AttemptOutcome::DeadLettered { attempt, id })
                } else {
                    let next_retry_at =
                        now + self.policy.next_delay(attempt).as_millis() as u64;
                    let updated = RetryRecord {
                        attempt_count: attempt,
                        last_error: error.to_string(),
                        next_retry_at,
                        updated_at: now,
                        ..record
                    };
                    self.retry_store.upsert(updated).await?;
                    tracing::warn!(
                        key = %key,
                        attempt,
                        error = %error,
                        next_retry_at,
                        "retry failed; rescheduled"
                    );
                    Ok(AttemptOutcome::Rescheduled { attempt, next_retry_at })
                }
            }
        }
    }

    /// One scheduler tick: process every record due right now, with bounded
    /// worker concurrency. Records for distinct keys run concurrently and
    /// never block each other; per-key sequencing holds because a key has at
    /// most one record and therefore at most one pending timer.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = self.clock.now_millis();
        self.sweep_due(now).await
    }

    /// Administrative override of the delay timer: process every pending
    /// record regardless of `next_retry_at`.
    pub async fn sweep_all(&self) -> Result<SweepReport, EngineError> {
        self.sweep_due(u64::MAX).await
    }

    async fn sweep_due(&self, due_before: u64) -> Result<SweepReport, EngineError> {
        let due = self.retry_store.due(due_before).await?;
        let outcomes = futures::future::join_all(due.into_iter().map(|record| async move {
            // Closed only on shutdown; treat a closed semaphore as a no-op.
            let Ok(_permit) = self.workers.acquire().await else {
                return None;
            };
            Some(self.process_record(record).await)
        }))
        .await;

        let mut report = SweepReport::default();
        for outcome in outcomes.into_iter().flatten() {
            report.processed += 1;
            match outcome {
                Ok(AttemptOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(AttemptOutcome::Rescheduled { .. }) => report.rescheduled += 1,
                Ok(AttemptOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                Err(error) => {
                    report.storage_errors += 1;
                    tracing::error!(%error, "retry attempt abandoned on storage failure");
                }
            }
        }
        Ok(report)
    }

    /// Periodic sweep loop. Returns when the shutdown signal flips to true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(error) = self.sweep().await {
                tracing::error!(%error, "sweep failed; will retry next interval");
            }
            tokio::select! {
                _ = self.sleeper.sleep(self.poll_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Newest-first dead letter listing for operator review.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, EngineError> {
        Ok(self.dead_letters.list(limit).await?)
    }

    /// Re-inject dead-lettered messages as fresh retries.
    ///
    /// Each found record becomes a retry record with `attempt_count = 0` and
    /// a synthetic manual-retry error, due immediately. The retry record is
    /// stored first and the dead letter deleted second: if the retry store is
    /// down the dead letter stays put and the operator can replay it again
    /// later, and a crash between the two writes leaves the message in both
    /// queues rather than in neither.
    pub async fn replay(&self, ids: &[u64]) -> Result<ReplayOutcome, EngineError> {
        let mut outcome = ReplayOutcome::default();
        for &id in ids {
            let Some(dead) = self.dead_letters.get(id).await? else {
                outcome.missing.push(id);
                continue;
            };
            let now = self.clock.now_millis();
            let record = RetryRecord {
                recipient: dead.recipient,
                recipient_user_id: dead.recipient_user_id,
                subject: dead.subject,
                message_type: dead.message_type,
                payload: dead.payload,
                tags: dead.tags,
                attempt_count: 0,
                last_error: MANUAL_RETRY_ERROR.into(),
                next_retry_at: now,
                original_send_time: dead.failed_at,
                created_at: now,
                updated_at: now,
            };
            let key = record.key();
            self.retry_store.upsert(record).await?;
            self.dead_letters.take(id).await?;
            tracing::info!(key = %key, id, "dead letter replayed");
            outcome.replayed.push(id);
        }
        Ok(outcome)
    }

    /// Administrative removal of a pending retry. Returns whether a record
    /// existed.
    pub async fn purge(&self, key: &RetryKey) -> Result<bool, EngineError> {
        let removed = self.retry_store.remove(key).await?;
        if removed {
            tracing::info!(key = %key, "pending retry purged by operator");
        }
        Ok(removed)
    }

    /// Aggregate statistics: queue depth, attempt breakdown, oldest pending
    /// retry, and the trailing success rate. Served from a short-TTL cache;
    /// slight staleness is acceptable for a read-mostly aggregate.
    pub async fn stats(&self) -> Result<RetryStats, EngineError> {
        let now = self.clock.now_millis();
        if let Some(cached) = self.metrics.cached_stats(now) {
            return Ok(cached);
        }
        let snapshot = self.retry_store.snapshot().await?;
        Ok(self.metrics.compute_stats(&snapshot, now))
    }

    /// Append to the DLQ, retrying the append itself on storage failure.
    /// Losing a dead letter record makes a message failure invisible, so this
    /// is the one storage write the engine refuses to give up on quietly.
    async fn append_dead_letter(
        &self,
        key: &RetryKey,
        record: DeadLetterRecord,
    ) -> Result<u64, EngineError> {
        let mut last_error = None;
        for attempt in 1..=DEAD_LETTER_APPEND_ATTEMPTS {
            match self.dead_letters.append(record.clone()).await {
                Ok(id) => return Ok(id),
                Err(error) => {
                    tracing::error!(key = %key, %error, attempt, "dead letter append failed");
                    last_error = Some(error);
                    if attempt < DEAD_LETTER_APPEND_ATTEMPTS {
                        self.sleeper.sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                }
            }
        }
        let source = last_error.unwrap_or_else(|| {
            crate::store::StoreError::Unavailable("dead letter append failed".into())
        });
        tracing::error!(key = %key, %source, "DEAD LETTER RECORD LOST");
        Err(EngineError::DeadLetterLost { key: key.clone(), source })
    }
}

/// Builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
    client: Arc<dyn SendClient>,
    retry_store: Arc<dyn RetryStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricsAggregator>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    send_timeout: Duration,
    poll_interval: Duration,
    worker_concurrency: usize,
}

impl DeliveryEngineBuilder {
    /// Create a builder with production defaults: in-memory stores, the
    /// default policy, wall clock time, 30s send timeout, 15s poll interval,
    /// and 5 concurrent workers.
    pub fn new(client: Arc<dyn SendClient>) -> Self {
        Self {
            client,
            retry_store: Arc::new(MemoryRetryStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            metrics: Arc::new(MetricsAggregator::default()),
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            send_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(15),
            worker_concurrency: 5,
        }
    }

    pub fn retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = store;
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Bound on a single send client call.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Interval between scheduler sweeps.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Maximum simultaneous worker attempts during a sweep.
    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Build the engine, validating inputs.
    pub fn build(self) -> Result<DeliveryEngine, BuildError> {
        if self.worker_concurrency == 0 {
            return Err(BuildError::ZeroConcurrency);
        }
        if self.send_timeout.is_zero() {
            return Err(BuildError::ZeroSendTimeout);
        }
        if self.poll_interval.is_zero() {
            return Err(BuildError::ZeroPollInterval);
        }
        Ok(DeliveryEngine {
            client: self.client,
            retry_store: self.retry_store,
            dead_letters: self.dead_letters,
            metrics: self.metrics,
            policy: self.policy,
            clock: self.clock,
            sleeper: self.sleeper,
            send_timeout: self.send_timeout,
            poll_interval: self.poll_interval,
            workers: Arc::new(Semaphore::new(self.worker_concurrency)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, Tags};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct AlwaysOkClient;

    #[async_trait]
    impl SendClient for AlwaysOkClient {
        async fn send(&self, _request: &SendRequest) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct HangingClient;

    #[async_trait]
    impl SendClient for HangingClient {
        async fn send(&self, _request: &SendRequest) -> Result<(), SendError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Dead letter store that fails the first `failures` appends.
    #[derive(Debug)]
    struct FlakyDeadLetterStore {
        remaining_failures: AtomicUsize,
        appends: AtomicUsize,
        inner: MemoryDeadLetterStore,
    }

    impl FlakyDeadLetterStore {
        fn new(failures: usize) -> Self {
            Self {
                remaining_failures: AtomicUsize::new(failures),
                appends: AtomicUsize::new(0),
                inner: MemoryDeadLetterStore::new(),
            }
        }
    }

    #[async_trait]
    impl DeadLetterStore for FlakyDeadLetterStore {
        async fn append(&self, record: DeadLetterRecord) -> Result<u64, StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("append rejected".into()));
            }
            self.inner.append(record).await
        }

        async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
            self.inner.list(limit).await
        }

        async fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn take(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError> {
            self.inner.take(id).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    fn failed_send(error: SendError) -> FailedSend {
        FailedSend {
            recipient: "ada@example.test".into(),
            recipient_user_id: None,
            subject: "Welcome".into(),
            message_type: "welcome".into(),
            payload: Payload::new(),
            tags: Tags::new(),
            error,
            original_send_time: 0,
        }
    }

    fn engine_with(client: Arc<dyn SendClient>) -> DeliveryEngine {
        DeliveryEngine::builder(client)
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .sleeper(Arc::new(crate::sleeper::InstantSleeper))
            .policy(
                RetryPolicy::builder()
                    .jitter_fraction(0.0)
                    .initial_delay(Duration::from_secs(60))
                    .build()
                    .expect("policy"),
            )
            .build()
            .expect("engine")
    }

    #[tokio::test]
    async fn builder_rejects_zero_concurrency() {
        let client = Arc::new(AlwaysOkClient::default());
        let err = DeliveryEngine::builder(client).worker_concurrency(0).build();
        assert!(matches!(err, Err(BuildError::ZeroConcurrency)));
    }

    #[tokio::test]
    async fn builder_rejects_zero_timeouts() {
        let client: Arc<dyn SendClient> = Arc::new(AlwaysOkClient::default());
        assert!(matches!(
            DeliveryEngine::builder(client.clone()).send_timeout(Duration::ZERO).build(),
            Err(BuildError::ZeroSendTimeout)
        ));
        assert!(matches!(
            DeliveryEngine::builder(client).poll_interval(Duration::ZERO).build(),
            Err(BuildError::ZeroPollInterval)
        ));
    }

    #[tokio::test]
    async fn hung_client_is_cut_off_and_rescheduled() {
        let engine = DeliveryEngine::builder(Arc::new(HangingClient))
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .sleeper(Arc::new(crate::sleeper::InstantSleeper))
            .send_timeout(Duration::from_millis(20))
            .policy(RetryPolicy::builder().jitter_fraction(0.0).build().expect("policy"))
            .build()
            .expect("engine");

        engine
            .handle_failure(failed_send(SendError::new("Connection timeout")))
            .await
            .unwrap();
        let due = engine.retry_store.due(u64::MAX).await.unwrap();
        let outcome = engine.process_record(due[0].clone()).await.unwrap();
        // Timeout counts as a retryable failure and loops through backoff.
        assert!(matches!(outcome, AttemptOutcome::Rescheduled { attempt: 2, .. }));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_signal() {
        let engine = Arc::new(engine_with(Arc::new(AlwaysOkClient::default())));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run should exit promptly")
            .expect("task");
    }

    #[tokio::test]
    async fn single_attempt_policy_dead_letters_on_entry() {
        let client = Arc::new(AlwaysOkClient::default());
        let engine = DeliveryEngine::builder(client)
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .policy(
                RetryPolicy::builder()
                    .max_attempts(1)
                    .jitter_fraction(0.0)
                    .build()
                    .expect("policy"),
            )
            .build()
            .expect("engine");

        let disposition = engine
            .handle_failure(failed_send(SendError::new("Connection timeout")))
            .await
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::DeadLettered { .. }));
        assert_eq!(engine.retry_store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_letter_append_is_retried_before_succeeding() {
        let dlq = Arc::new(FlakyDeadLetterStore::new(2));
        let engine = DeliveryEngine::builder(Arc::new(AlwaysOkClient::default()))
            .dead_letter_store(dlq.clone())
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .sleeper(Arc::new(crate::sleeper::InstantSleeper))
            .build()
            .expect("engine");

        let disposition = engine
            .handle_failure(failed_send(SendError::new("Invalid email address: foo@bar")))
            .await
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::DeadLettered { .. }));
        assert_eq!(dlq.appends.load(Ordering::SeqCst), 3);
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_dead_letter_append_surfaces_loudly() {
        let dlq = Arc::new(FlakyDeadLetterStore::new(usize::MAX));
        let engine = DeliveryEngine::builder(Arc::new(AlwaysOkClient::default()))
            .dead_letter_store(dlq.clone())
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .sleeper(Arc::new(crate::sleeper::InstantSleeper))
            .build()
            .expect("engine");

        let err = engine
            .handle_failure(failed_send(SendError::new("address bounced")))
            .await
            .unwrap_err();
        assert!(err.is_dead_letter_lost());
        assert_eq!(dlq.appends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dead_letter_append_backs_off_between_attempts() {
        let dlq = Arc::new(FlakyDeadLetterStore::new(2));
        let sleeper = crate::sleeper::TrackingSleeper::new();
        let engine = DeliveryEngine::builder(Arc::new(AlwaysOkClient::default()))
            .dead_letter_store(dlq.clone())
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .expect("engine");

        engine
            .handle_failure(failed_send(SendError::new("Invalid email address: foo@bar")))
            .await
            .unwrap();
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    /// Retry store whose writes always fail.
    #[derive(Debug)]
    struct RejectingRetryStore;

    #[async_trait]
    impl RetryStore for RejectingRetryStore {
        async fn upsert(&self, _record: RetryRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("retry store down".into()))
        }

        async fn due(&self, _now: u64) -> Result<Vec<RetryRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn remove(&self, _key: &RetryKey) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn snapshot(&self) -> Result<Vec<RetryRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn count(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failed_replay_leaves_dead_letter_in_place() {
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let id = dlq
            .append(DeadLetterRecord {
                id: 0,
                recipient: "ada@example.test".into(),
                recipient_user_id: None,
                subject: "Welcome".into(),
                message_type: "welcome".into(),
                payload: Payload::new(),
                tags: Tags::new(),
                final_error: "Email bounced".into(),
                failed_at: 500,
                created_at: 500,
            })
            .await
            .unwrap();

        let engine = DeliveryEngine::builder(Arc::new(AlwaysOkClient::default()))
            .retry_store(Arc::new(RejectingRetryStore))
            .dead_letter_store(dlq.clone())
            .clock(Arc::new(crate::clock::ManualClock::new(1_000)))
            .build()
            .expect("engine");

        let err = engine.replay(&[id]).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        // The dead letter survives the failed replay and can be retried.
        assert_eq!(dlq.count().await.unwrap(), 1);
        assert!(dlq.get(id).await.unwrap().is_some());
    }
}
