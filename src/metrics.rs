//! Outcome metrics and aggregate retry statistics.
//!
//! Every terminal state transition records a [`MetricEvent`]; events older
//! than the retention window are pruned on write and read, so memory stays
//! bounded without a separate purge job. Aggregate statistics are cached for
//! a short TTL because operators poll them far more often than the
//! underlying events change.

use crate::message::{MetricEvent, Outcome, RetryRecord};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Default trailing window for rate calculation (24h).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default TTL for the cached aggregate (5 minutes).
pub const DEFAULT_STATS_TTL: Duration = Duration::from_secs(5 * 60);

/// Aggregate retry statistics for the operator surface.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RetryStats {
    /// Pending retry records.
    pub total_in_queue: usize,
    /// Queue breakdown by attempt count.
    pub by_attempt_count: BTreeMap<u32, usize>,
    /// `next_retry_at` of the longest-waiting pending record, if any.
    pub oldest_retry_at: Option<u64>,
    /// Success percentage over the trailing window; `None` with no events.
    /// A falling rate indicates a systemic provider problem rather than
    /// transient noise.
    pub retry_rate: Option<f64>,
}

/// Rolling per-attempt outcome aggregator.
#[derive(Debug)]
pub struct MetricsAggregator {
    retention: Duration,
    stats_ttl: Duration,
    events: Mutex<VecDeque<MetricEvent>>,
    cache: Mutex<Option<(u64, RetryStats)>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_STATS_TTL)
    }
}

impl MetricsAggregator {
    pub fn new(retention: Duration, stats_ttl: Duration) -> Self {
        Self {
            retention,
            stats_ttl,
            events: Mutex::new(VecDeque::new()),
            cache: Mutex::new(None),
        }
    }

    /// Record one terminal attempt outcome.
    pub fn record(&self, outcome: Outcome, attempt_count: u32, now: u64) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            // Metrics are best-effort; a poisoned lock must not take down a
            // delivery attempt.
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push_back(MetricEvent { outcome, attempt_count, created_at: now });
        Self::prune(&mut events, self.retention, now);
    }

    /// Success percentage (0..=100) over the trailing window.
    pub fn retry_rate(&self, now: u64) -> Option<f64> {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::prune(&mut events, self.retention, now);
        let total = events.len();
        if total == 0 {
            return None;
        }
        let successes = events.iter().filter(|e| e.outcome == Outcome::Success).count();
        Some(successes as f64 / total as f64 * 100.0)
    }

    /// Cached aggregate, if recorded within the TTL.
    pub fn cached_stats(&self, now: u64) -> Option<RetryStats> {
        let cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .as_ref()
            .filter(|(at, _)| now.saturating_sub(*at) < self.stats_ttl.as_millis() as u64)
            .map(|(_, stats)| stats.clone())
    }

    /// Compute the aggregate from a queue snapshot and refresh the cache.
    pub fn compute_stats(&self, queue: &[RetryRecord], now: u64) -> RetryStats {
        let mut by_attempt_count: BTreeMap<u32, usize> = BTreeMap::new();
        for record in queue {
            *by_attempt_count.entry(record.attempt_count).or_insert(0) += 1;
        }
        let stats = RetryStats {
            total_in_queue: queue.len(),
            by_attempt_count,
            oldest_retry_at: queue.iter().map(|r| r.next_retry_at).min(),
            retry_rate: self.retry_rate(now),
        };
        match self.cache.lock() {
            Ok(mut guard) => *guard = Some((now, stats.clone())),
            Err(poisoned) => *poisoned.into_inner() = Some((now, stats.clone())),
        }
        stats
    }

    fn prune(events: &mut VecDeque<MetricEvent>, retention: Duration, now: u64) {
        let cutoff = now.saturating_sub(retention.as_millis() as u64);
        while events.front().is_some_and(|e| e.created_at < cutoff) {
            events.pop_front();
        }
    }
}
