//! Sleep seam for the scheduler loop and storage retries.
//!
//! The engine sleeps in two places: between scheduler sweeps and between
//! dead letter append attempts. Routing both through [`Sleeper`] keeps the
//! tests free of real delays and lets them assert on the exact delays the
//! engine requested.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Boxed-future sleep, object safe so the engine can hold `Arc<dyn Sleeper>`.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that completes immediately, for tests that drive the engine
/// through many sweep intervals without waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Sleeper that records every requested delay and completes immediately.
///
/// Clones share the call log, so a test can hand one clone to the engine and
/// keep another to assert on the delays the engine asked for.
#[derive(Debug, Default, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_completes_immediately() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_shares_calls_across_clones() {
        let sleeper = TrackingSleeper::new();
        let handle = sleeper.clone();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;

        assert_eq!(
            handle.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }
}
