//! # Request Gate
//!
//! A token bucket of size one. Every caller is let through, but never sooner than
//! `min_interval` after the previous caller was let through; the remainder is
//! slept rather than the request being dropped. Callers are served one at a
//! time because the lock is held across the wait.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

pub struct RequestGate {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a request may be issued and records it as issued.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut last = self.last_request.lock().await;

        let waited = match *last {
            Some(previous) => {
                let elapsed = previous.elapsed();
                if elapsed < self.min_interval {
                    let remaining = self.min_interval - elapsed;
                    log::debug!("Rate gate holding request for {:?}", remaining);
                    sleep(remaining).await;
                    remaining
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };

        *last = Some(Instant::now());
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Paused clocks resolve timers on millisecond ticks.
    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let gate = RequestGate::new(Duration::from_secs(1));
        assert_eq!(gate.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_waits_for_remainder() {
        let gate = RequestGate::new(Duration::from_millis(1000));
        let start = Instant::now();
        gate.acquire().await;

        tokio::time::advance(Duration::from_millis(300)).await;
        let waited = gate.acquire().await;

        assert_eq!(waited, Duration::from_millis(700));
        assert_close(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_interval_passed() {
        let gate = RequestGate::new(Duration::from_millis(100));
        gate.acquire().await;
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(gate.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_spaced() {
        let gate = Arc::new(RequestGate::new(Duration::from_millis(500)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap() - start);
        }
        stamps.sort();
        assert_close(stamps[0], Duration::ZERO);
        assert_close(stamps[1], Duration::from_millis(500));
        assert_close(stamps[2], Duration::from_millis(1000));
    }
}
