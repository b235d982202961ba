//! Bandwidth throttling and speed measurement.
//!
//! All chunk streams of a session consume from one shared token bucket.
//! Instead of each worker throttling itself, they draw from a central pool,
//! which keeps the aggregate rate at the cap without the bursty traffic
//! that triggers server-side resets. Speed reporting is separate: each
//! stream carries a sliding one-second window that yields the instantaneous
//! bytes/s fed to the aggregator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Refill cadence of the bucket. High frequency pacing keeps streams hot.
const REFILL_INTERVAL: Duration = Duration::from_millis(10);

/// A shared token-bucket rate limiter coordinating all streams of a
/// session.
pub struct RateLimiter {
    /// Bytes per second; 0 disables pacing. May change live.
    limit: AtomicU64,
    tokens: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    /// Starts with a full bucket (one second of burst).
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            tokens: AtomicU64::new(limit),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Changes the cap live. The bucket resets so the new rate takes
    /// effect within one refill interval.
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
        self.tokens.store(limit, Ordering::Relaxed);
        if let Ok(mut last) = self.last_refill.lock() {
            *last = Instant::now();
        }
    }

    /// Consumes `amount` tokens, sleeping while the bucket is short.
    ///
    /// Acquisition proceeds in increments so a single received buffer
    /// larger than the one-second burst cap cannot deadlock. Returns early
    /// when the cancel token fires.
    pub async fn acquire(&self, amount: u64, cancel: &CancellationToken) {
        if self.limit.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = amount;
        while remaining > 0 {
            if cancel.is_cancelled() {
                return;
            }
            let limit = self.limit.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            // Refill based on elapsed time, capped at 1s worth of tokens.
            {
                let mut last_refill = self.last_refill.lock().unwrap();
                let elapsed = last_refill.elapsed().as_secs_f64();
                if elapsed >= REFILL_INTERVAL.as_secs_f64() {
                    let refill = (limit as f64 * elapsed) as u64;
                    if refill > 0 {
                        let current = self.tokens.load(Ordering::Relaxed);
                        self.tokens.store((current + refill).min(limit), Ordering::Relaxed);
                        *last_refill = Instant::now();
                    }
                }
            }

            let current = self.tokens.load(Ordering::Relaxed);
            if current > 0 {
                let take = remaining.min(current);
                if self
                    .tokens
                    .compare_exchange(current, current - take, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    remaining -= take;
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(REFILL_INTERVAL) => {}
            }
        }
    }
}

/// Sliding one-second accumulator producing an instantaneous bytes/s
/// figure. Resets whenever the window elapses, so a stalled stream decays
/// to a fresh measurement instead of averaging over its whole life.
#[derive(Debug)]
pub struct SpeedWindow {
    window_start: Instant,
    bytes: u64,
}

impl SpeedWindow {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes: 0,
        }
    }

    /// Records `n` freshly transferred bytes and returns the current rate
    /// over the window.
    pub fn record(&mut self, n: u64) -> u64 {
        let elapsed = self.window_start.elapsed();
        if elapsed > Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.bytes = n;
            return self.bytes;
        }
        self.bytes += n;
        rate(self.bytes, elapsed.as_millis() as u64)
    }

    /// Discards the accumulator, e.g. after a live rate-cap change.
    pub fn reset(&mut self) {
        self.window_start = Instant::now();
        self.bytes = 0;
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes/s over an elapsed span, treating sub-millisecond spans as 1 ms.
fn rate(bytes: u64, elapsed_ms: u64) -> u64 {
    bytes * 1000 / elapsed_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_math() {
        assert_eq!(rate(500, 1000), 500);
        assert_eq!(rate(500, 500), 1000);
        assert_eq!(rate(100, 0), 100_000); // clamped elapsed
    }

    #[tokio::test]
    async fn unlimited_acquire_returns_immediately() {
        let limiter = RateLimiter::new(0);
        let started = Instant::now();
        limiter.acquire(10_000_000, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_paces_beyond_the_burst() {
        // 1000 B/s with a full initial bucket: 1500 bytes need ~0.5s of
        // refill on top of the burst.
        let limiter = RateLimiter::new(1000);
        let started = Instant::now();
        limiter.acquire(1500, &CancellationToken::new()).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn cancelled_acquire_stops_waiting() {
        let limiter = RateLimiter::new(10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        // Far more than the bucket holds; without cancellation this would
        // sleep for minutes.
        limiter.acquire(10_000, &cancel).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn live_limit_change_resets_the_bucket() {
        let limiter = RateLimiter::new(10);
        limiter.set_limit(1_000_000);
        let started = Instant::now();
        limiter.acquire(500_000, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn window_accumulates_and_resets() {
        let mut window = SpeedWindow::new();
        let first = window.record(100);
        assert!(first > 0);
        window.record(100);
        assert_eq!(window.bytes, 200);

        window.reset();
        assert_eq!(window.bytes, 0);
    }
}
