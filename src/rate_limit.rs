//! Sliding-window rate limiter for outbound requests.
//!
//! [`RateLimiter::acquire`] admits at most `max_requests` requests within any
//! trailing window of `window` length. Callers that arrive at capacity sleep
//! until the oldest admitted request leaves the window and then check again,
//! since another caller may have taken the freed slot in the meantime.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests.max(1))),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_millis(config.window_ms))
    }

    /// Wait until a request may be issued, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = admitted.front() {
                    if now.duration_since(oldest) >= self.window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }

                if admitted.len() < self.max_requests {
                    admitted.push_back(now);
                    return;
                }

                // Non-empty here: len >= max_requests >= 1.
                let oldest = admitted[0];
                self.window.saturating_sub(now.duration_since(oldest))
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of requests admitted within the current window.
    pub async fn in_flight_window(&self) -> usize {
        let mut admitted = self.admitted.lock().await;
        let now = Instant::now();
        admitted.retain(|t| now.duration_since(*t) < self.window);
        admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn sixth_acquire_waits_for_window() {
        let limiter = RateLimiter::new(5, Duration::from_millis(1000));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn window_never_exceeds_capacity() {
        let limiter = RateLimiter::new(3, Duration::from_millis(500));
        for _ in 0..7 {
            limiter.acquire().await;
            assert!(limiter.in_flight_window().await <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_budget() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_millis(1000)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                start.elapsed()
            }));
        }
        let mut elapsed = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap());
        }
        elapsed.sort();
        assert!(elapsed[1] < Duration::from_millis(1000));
        assert!(elapsed[2] >= Duration::from_millis(1000));
        assert!(elapsed[3] >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_up_after_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(200));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
