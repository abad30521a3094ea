//! Durable record types for the delivery engine.
//!
//! All records serialize with serde so storage backends can persist them in
//! whatever format they like (rows, documents, JSONL). Timestamps are wall
//! clock milliseconds since the Unix epoch, produced by a [`Clock`]
//! implementation so tests can run on frozen time.
//!
//! [`Clock`]: crate::clock::Clock

use crate::send::SendError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque message payload handed through to the send client.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Free-form observability tags attached to a message.
pub type Tags = BTreeMap<String, String>;

/// Uniqueness key for pending retries: one logical message per
/// (recipient, message type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetryKey {
    pub recipient: String,
    pub message_type: String,
}

impl RetryKey {
    pub fn new<R, M>(recipient: R, message_type: M) -> Self
    where
        R: Into<String>,
        M: Into<String>,
    {
        Self { recipient: recipient.into(), message_type: message_type.into() }
    }
}

impl std::fmt::Display for RetryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.recipient, self.message_type)
    }
}

/// One pending retry for a logical message.
///
/// At most one record exists per [`RetryKey`]; a second failure for the same
/// key collapses into the existing record via the store's upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub recipient: String,
    pub recipient_user_id: Option<String>,
    pub subject: String,
    pub message_type: String,
    pub payload: Payload,
    pub tags: Tags,
    /// Number of failed attempts so far (>= 1 for records created by the
    /// automatic flow; 0 immediately after an operator replay).
    pub attempt_count: u32,
    pub last_error: String,
    /// Epoch millis at which the next attempt becomes due.
    pub next_retry_at: u64,
    /// Epoch millis of the original (pre-engine) send.
    pub original_send_time: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RetryRecord {
    pub fn key(&self) -> RetryKey {
        RetryKey::new(self.recipient.clone(), self.message_type.clone())
    }
}

/// Terminal record for a message that exhausted retries or failed permanently.
///
/// Immutable once written; removed only by a successful operator replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Store-assigned identifier, used to address the record for replay.
    pub id: u64,
    pub recipient: String,
    pub recipient_user_id: Option<String>,
    pub subject: String,
    pub message_type: String,
    pub payload: Payload,
    pub tags: Tags,
    pub final_error: String,
    pub failed_at: u64,
    pub created_at: u64,
}

/// Terminal outcome of one delivery attempt, recorded for rate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

/// One metric event per terminal attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub outcome: Outcome,
    pub attempt_count: u32,
    pub created_at: u64,
}

/// A failed send entering the engine from the outside.
///
/// This is the boundary type callers hand to
/// [`DeliveryEngine::handle_failure`]: the original attempt already happened
/// and failed with `error`.
///
/// [`DeliveryEngine::handle_failure`]: crate::engine::DeliveryEngine::handle_failure
#[derive(Debug, Clone)]
pub struct FailedSend {
    pub recipient: String,
    pub recipient_user_id: Option<String>,
    pub subject: String,
    pub message_type: String,
    pub payload: Payload,
    pub tags: Tags,
    pub error: SendError,
    /// Epoch millis of the original send attempt.
    pub original_send_time: u64,
}

impl FailedSend {
    pub fn key(&self) -> RetryKey {
        RetryKey::new(self.recipient.clone(), self.message_type.clone())
    }
}
