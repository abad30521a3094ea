//! Send client boundary.
//!
//! The engine does not dictate a transport; it only requires this contract:
//! an attempt either succeeds or fails with a [`SendError`] the classifier
//! can inspect. Provider adapters (SMTP, HTTP APIs) implement [`SendClient`].

use crate::message::{Payload, Tags};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error reported by a send client.
///
/// Carries the human-readable provider message plus an optional HTTP-like
/// status code used as a classification fallback when no textual pattern
/// matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendError {
    pub message: String,
    pub status: Option<u16>,
}

impl SendError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self { message: message.into(), status: None }
    }

    pub fn with_status<S: Into<String>>(message: S, status: u16) -> Self {
        Self { message: message.into(), status: Some(status) }
    }

    /// Synthetic error for an attempt that exceeded the caller's timeout.
    /// Worded to match the retryable pattern set.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::new(format!("Connection timeout after {:?}", timeout))
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SendError {}

/// One delivery attempt as seen by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    pub message_type: String,
    pub payload: Payload,
    /// Observability tags; the worker adds the attempt number under
    /// `"attempt"` before calling the client.
    pub tags: Tags,
}

/// Transactional delivery provider.
#[async_trait]
pub trait SendClient: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_status_when_present() {
        let err = SendError::with_status("Too many requests", 429);
        assert_eq!(err.to_string(), "Too many requests (status 429)");
        assert_eq!(SendError::new("boom").to_string(), "boom");
    }

    #[test]
    fn timed_out_matches_retryable_wording() {
        let err = SendError::timed_out(std::time::Duration::from_secs(30));
        assert!(err.message.to_ascii_lowercase().contains("timeout"));
        assert!(err.status.is_none());
    }
}
