//! Durable storage seams: retry queue and dead letter queue.
//!
//! The traits assume a key-value model and are designed so both in-process
//! and distributed backends can implement them. The engine never caches
//! record state across invocations; every mutation goes through `upsert`,
//! `remove`, `append`, or `take`, so workers on different processes stay
//! consistent as long as the backend makes those operations atomic.
//!
//! The in-memory implementations here are the reference backends used in
//! tests and single-process deployments.

use crate::message::{DeadLetterRecord, RetryKey, RetryRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Storage backend failure.
///
/// Always fatal to the current attempt; the engine logs these at error
/// severity because a lost write can make a message failure invisible.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend rejected the operation: {0}")]
    Rejected(String),
    #[error("storage backend I/O failure")]
    Io(#[from] std::io::Error),
}

/// Durable queue of pending retries, at most one record per [`RetryKey`].
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert the record, or collapse it into the existing record for the
    /// same key. Must be atomic with respect to concurrent upserts for the
    /// same key: two racing failures may not create two retry timers.
    ///
    /// When a record already exists, the incoming record wins but keeps the
    /// original `created_at` and the larger `attempt_count`, so a stale
    /// concurrent writer cannot roll the counter backwards.
    async fn upsert(&self, record: RetryRecord) -> Result<(), StoreError>;

    /// Records whose `next_retry_at` is at or before `now`.
    async fn due(&self, now: u64) -> Result<Vec<RetryRecord>, StoreError>;

    /// Remove the record for a key. Returns whether a record existed.
    async fn remove(&self, key: &RetryKey) -> Result<bool, StoreError>;

    /// All pending records, for statistics and operator inspection.
    async fn snapshot(&self) -> Result<Vec<RetryRecord>, StoreError>;

    /// Number of pending records.
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Append-only queue of terminally failed messages.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append a record, returning its store-assigned id.
    async fn append(&self, record: DeadLetterRecord) -> Result<u64, StoreError>;

    /// Newest-first listing (ordered by `failed_at` descending) for operator
    /// review.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError>;

    /// Read a record by id without deleting it. `None` if absent.
    async fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError>;

    /// Atomically read and delete a record by id. `None` if absent (already
    /// replayed or never written). Atomicity prevents double replay.
    async fn take(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, StoreError>;
}

/// In-memory retry store: mutex-guarded map keyed by [`RetryKey`].
#[derive(Debug, Default, Clone)]
pub struct MemoryRetryStore {
    records: Arc<Mutex<HashMap<RetryKey, RetryRecord>>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RetryKey, RetryRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("retry store mutex poisoned".into()))
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn upsert(&self, mut record: RetryRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let key = record.key();
        if let Some(existing) = records.get(&key) {
            record.created_at = existing.created_at;
            record.attempt_count = record.attempt_count.max(existing.attempt_count);
        }
        records.insert(key, record);
        Ok(())
    }

    async fn due(&self, now: u64) -> Result<Vec<RetryRecord>, StoreError> {
        let records = self.lock()?;
        let mut due: Vec<RetryRecord> =
            records.values().filter(|r| r.next_retry_at <= now).cloned().collect();
        due.sort_by_key(|r| r.next_retry_at);
        Ok(due)
    }

    async fn remove(&self, key: &RetryKey) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn snapshot(&self) -> Result<Vec<RetryRecord>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }
}

/// In-memory dead letter store with a monotonically increasing id counter.
#[derive(Debug, Default, Clone)]
pub struct MemoryDeadLetterStore {
    inner: Arc<Mutex<DeadLetterInner>>,
}

#[derive(Debug, Default)]
struct DeadLetterInner {
    next_id: u64,
    records: HashMap<u64, DeadLetterRecord>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DeadLetterInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("dead letter store mutex poisoned".into()))
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, mut record: DeadLetterRecord) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        record.id = id;
        inner.records.insert(id, record);
        Ok(id)
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let inner = self.lock()?;
        let mut records: Vec<DeadLetterRecord> = inner.records.values().cloned().collect();
        // Newest first; ties broken by id so ordering is stable.
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    async fn take(&self, id: u64) -> Result<Option<DeadLetterRecord>, StoreError> {
        Ok(self.lock()?.records.remove(&id))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.records.len())
    }
}
