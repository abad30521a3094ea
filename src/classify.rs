//! Failure classification: retryable or permanent.
//!
//! Decision order (first match wins):
//! 1. Permanent text patterns (bad address, suppression, auth).
//! 2. Retryable text patterns (rate limit, timeout, network, DNS, 503).
//! 3. Status-code fallback: 5xx/429 retryable, other 4xx permanent.
//! 4. Unknown errors default to retryable; a wasted retry beats silently
//!    dropping a message.
//!
//! Permanent patterns are checked first so an error mentioning both a
//! permanent and a retryable keyword ("suppressed ... rate limit") still
//! terminates. Matching is case-insensitive substring matching, which is
//! brittle by nature; [`SendError`] also carries the structured status code
//! fallback for exactly that reason.
//!
//! [`SendError`]: crate::send::SendError

use crate::send::SendError;

/// Outcome of classifying a send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Believed transient; worth another attempt.
    Retryable,
    /// Will not resolve on retry; dead-letter immediately.
    Permanent,
}

/// Message fragments that mark a failure as permanent.
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid email",
    "invalid recipient",
    "invalid address",
    "malformed address",
    "suppressed",
    "unsubscribed",
    "suppression list",
    "bounced",
    "hard bounce",
    "invalid credentials",
    "invalid api key",
    "authentication failed",
    "unauthorized",
    "permission denied",
    "forbidden",
];

/// Message fragments that mark a failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "network",
    "dns",
    "name resolution",
    "service unavailable",
    "temporarily unavailable",
    "internal server error",
];

/// Classify a send failure as retryable or permanent.
pub fn classify(error: &SendError) -> Classification {
    let message = error.message.to_ascii_lowercase();

    if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification::Permanent;
    }
    if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification::Retryable;
    }
    if let Some(status) = error.status {
        return match status {
            429 => Classification::Retryable,
            500..=599 => Classification::Retryable,
            400..=499 => Classification::Permanent,
            _ => Classification::Retryable,
        };
    }
    Classification::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(message: &str) -> SendError {
        SendError::new(message)
    }

    #[test]
    fn permanent_patterns_classify_permanent() {
        for message in [
            "Invalid email address: foo@bar",
            "Recipient unsubscribed from this list",
            "Address bounced previously",
            "Invalid credentials provided",
            "Authentication failed for sender",
            "Permission denied by provider policy",
            "address is on the suppression list",
        ] {
            assert_eq!(classify(&text(message)), Classification::Permanent, "{message}");
        }
    }

    #[test]
    fn retryable_patterns_classify_retryable() {
        for message in [
            "Rate limit exceeded, slow down",
            "Connection timeout",
            "connection refused by upstream",
            "Network unreachable",
            "DNS resolution failure",
            "Service unavailable, try later",
        ] {
            assert_eq!(classify(&text(message)), Classification::Retryable, "{message}");
        }
    }

    #[test]
    fn permanent_patterns_win_over_retryable_text() {
        // Both keyword sets present; permanent must take precedence.
        let err = text("Recipient suppressed while provider reported rate limit");
        assert_eq!(classify(&err), Classification::Permanent);

        // And the reverse ordering inside the message changes nothing.
        let err = text("rate limit hit; address bounced");
        assert_eq!(classify(&err), Classification::Permanent);
    }

    #[test]
    fn status_code_fallback_applies_only_without_text_match() {
        assert_eq!(
            classify(&SendError::with_status("opaque provider failure", 503)),
            Classification::Retryable
        );
        assert_eq!(
            classify(&SendError::with_status("opaque provider failure", 429)),
            Classification::Retryable
        );
        assert_eq!(
            classify(&SendError::with_status("opaque provider failure", 422)),
            Classification::Permanent
        );
        // Text match beats a contradictory status.
        assert_eq!(
            classify(&SendError::with_status("rate limit exceeded", 400)),
            Classification::Retryable
        );
        assert_eq!(
            classify(&SendError::with_status("address bounced", 500)),
            Classification::Permanent
        );
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        assert_eq!(classify(&text("something inscrutable happened")), Classification::Retryable);
        // Unusual status outside 4xx/5xx also falls back to retryable.
        assert_eq!(
            classify(&SendError::with_status("odd", 302)),
            Classification::Retryable
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify(&text("RATE LIMIT EXCEEDED")), Classification::Retryable);
        assert_eq!(classify(&text("INVALID EMAIL ADDRESS")), Classification::Permanent);
    }
}
