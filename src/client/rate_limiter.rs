//! Per-model request pacing.
//!
//! Two mechanisms:
//! - a sliding one-minute window capping requests per model (`max_rpm`)
//! - a cool-down after a 429, honoring `Retry-After` when the provider sends it
//!
//! Pacing reduces how often the provider says no; it does not replace the
//! pipeline retry policy, which still handles the 429s that get through.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_COOLDOWN_SECS: f64 = 60.0;

/// Pacing state for a single model.
#[derive(Debug, Default)]
struct ModelWindow {
    /// Start times of requests in the current window (may lie in the future
    /// for reserved slots)
    sent: VecDeque<Instant>,
    /// No requests before this time
    cooldown_until: Option<Instant>,
    /// Consecutive 429 responses
    consecutive_429s: u32,
}

impl ModelWindow {
    /// Reserve the next slot and return how long to wait for it.
    fn reserve(&mut self, max_rpm: u32, now: Instant) -> Duration {
        while self.sent.front().is_some_and(|&t| t + WINDOW <= now) {
            self.sent.pop_front();
        }

        let mut start = now;
        if let Some(until) = self.cooldown_until.filter(|&t| t > start) {
            start = until;
        }

        let max_rpm = max_rpm as usize;
        if max_rpm > 0 && self.sent.len() >= max_rpm {
            // Slot frees when the max_rpm-th most recent request leaves the window.
            let oldest_in_window = self.sent[self.sent.len() - max_rpm];
            start = start.max(oldest_in_window + WINDOW);
        }

        if max_rpm > 0 {
            self.sent.push_back(start);
        }
        start - now
    }

    /// Start a cool-down; provider hints are capped like computed backoff.
    fn record_429(&mut self, retry_after: Option<Duration>, now: Instant) -> Duration {
        self.consecutive_429s += 1;
        let max_cooldown = Duration::from_secs_f64(MAX_COOLDOWN_SECS);
        let backoff = match retry_after {
            Some(hint) => hint.min(max_cooldown),
            None => Duration::from_secs_f64(
                2.0_f64
                    .powi(self.consecutive_429s.min(i32::MAX as u32) as i32)
                    .min(MAX_COOLDOWN_SECS),
            ),
        };
        self.cooldown_until = Some(now + backoff);
        backoff
    }

    fn record_success(&mut self) {
        if self.consecutive_429s > 0 {
            self.consecutive_429s = 0;
            self.cooldown_until = None;
        }
    }
}

/// Request pacer shared by every stage that talks to one provider.
#[derive(Debug)]
pub struct RateLimiter {
    /// Requests per minute per model; 0 disables the window
    max_rpm: u32,
    windows: DashMap<String, ModelWindow>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RateLimiter {
    /// Create a limiter allowing `max_rpm` requests per minute per model.
    pub fn new(max_rpm: u32) -> Self {
        Self {
            max_rpm,
            windows: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_429s: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Wait for a request slot for `model`.
    ///
    /// Returns the duration waited.
    pub async fn acquire(&self, model: &str) -> Duration {
        let wait = {
            let mut window = self.windows.entry(model.to_string()).or_default();
            window.reserve(self.max_rpm, Instant::now())
        };
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if wait > Duration::ZERO {
            debug!(model = model, wait_ms = wait.as_millis() as u64, "Pacing request");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Put `model` into cool-down after a 429.
    pub fn record_429(&self, model: &str, retry_after: Option<Duration>) {
        self.total_429s.fetch_add(1, Ordering::Relaxed);
        let mut window = self.windows.entry(model.to_string()).or_default();
        let backoff = window.record_429(retry_after, Instant::now());
        warn!(
            model = model,
            consecutive_429s = window.consecutive_429s,
            cooldown_secs = backoff.as_secs_f64(),
            "Rate limited (429), cooling down"
        );
    }

    /// Clear any cool-down after a successful request.
    pub fn record_success(&self, model: &str) {
        if let Some(mut window) = self.windows.get_mut(model) {
            window.record_success();
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);
        let total_wait_ms = self.total_wait_ms.load(Ordering::Relaxed);

        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: total_wait_ms as f64 / 1000.0,
            rate_limit_ratio: if total_requests > 0 {
                total_429s as f64 / total_requests as f64
            } else {
                0.0
            },
            models_tracked: self.windows.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub rate_limit_ratio: f64,
    pub models_tracked: usize,
}
