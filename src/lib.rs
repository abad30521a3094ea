#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # redrive
//!
//! Reliable delivery engine for outbound notifications: transiently failed
//! sends are retried with bounded, jittered exponential backoff; permanent
//! failures and exhausted retries land in a durable dead letter queue with
//! operator listing and replay.
//!
//! ## Features
//!
//! - **Failure classification**: pattern and status-code based split into
//!   retryable vs permanent, biased toward retrying the unknown
//! - **Jittered exponential backoff** capped at a maximum delay
//! - **Idempotent retry queue**: at most one pending retry per
//!   (recipient, message type), enforced by the store's atomic upsert
//! - **Dead letter queue** with newest-first listing and operator replay
//! - **Rolling metrics**: queue depth, attempt breakdown, trailing success
//!   rate with a short-TTL cache
//! - **Pluggable seams**: send client, stores, clock, and sleeper are traits
//!   so backends and tests swap in freely
//!
//! ## Quick Start
//!
//! ```rust
//! use redrive::{
//!     DeliveryEngine, FailedSend, Payload, RetryPolicy, SendClient, SendError, SendRequest,
//!     Tags,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Provider;
//!
//! #[async_trait]
//! impl SendClient for Provider {
//!     async fn send(&self, _request: &SendRequest) -> Result<(), SendError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = DeliveryEngine::builder(Arc::new(Provider))
//!         .policy(RetryPolicy::default())
//!         .build()
//!         .unwrap();
//!
//!     engine
//!         .handle_failure(FailedSend {
//!             recipient: "ada@example.test".into(),
//!             recipient_user_id: None,
//!             subject: "Welcome".into(),
//!             message_type: "welcome".into(),
//!             payload: Payload::new(),
//!             tags: Tags::new(),
//!             error: SendError::new("Connection timeout"),
//!             original_send_time: 0,
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod backoff;
pub mod classify;
pub mod clock;
pub mod engine;
pub mod error;
pub mod message;
pub mod metrics;
pub mod send;
pub mod sleeper;
pub mod store;

// Re-exports
pub use backoff::{PolicyError, RetryPolicy, RetryPolicyBuilder};
pub use classify::{classify, Classification};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    AttemptOutcome, BuildError, DeliveryEngine, DeliveryEngineBuilder, FailureDisposition,
    ReplayOutcome, SweepReport,
};
pub use error::EngineError;
pub use message::{
    DeadLetterRecord, FailedSend, MetricEvent, Outcome, Payload, RetryKey, RetryRecord, Tags,
};
pub use metrics::{MetricsAggregator, RetryStats};
pub use send::{SendClient, SendError, SendRequest};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    DeadLetterStore, MemoryDeadLetterStore, MemoryRetryStore, RetryStore, StoreError,
};
