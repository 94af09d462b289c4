//! Windowed rate limiting for intent creation.
//!
//! Unauthenticated callers can mint intents, so creation is throttled per
//! caller key (client IP by default). Counting is a fixed window per key:
//! the first hit opens the window, later hits within it increment the count,
//! and a hit after the window resets it. Stale windows are swept by a
//! background task with an explicit lifecycle so tests and shutdown stay
//! deterministic.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

pub const DEFAULT_LIMIT: u32 = 60;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    opened_at: Instant,
}

/// Outcome of a rate-limit check. `retry_after` is whole seconds until the
/// current window closes, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    limit: u32,
    window: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            limit,
            window,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Records a hit for `key` and decides whether it is within the limit.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            opened_at: now,
        });
        if now.duration_since(entry.opened_at) >= self.window {
            entry.count = 0;
            entry.opened_at = now;
        }
        entry.count += 1;
        if entry.count > self.limit {
            let remaining = self.window.saturating_sub(now.duration_since(entry.opened_at));
            let retry_after = remaining.as_secs().max(1);
            return RateLimitDecision::Limited { retry_after };
        }
        RateLimitDecision::Allowed
    }

    /// Spawns the background sweep that drops expired windows. Idempotent in
    /// effect; call once at startup.
    pub fn start_sweeper(&self) {
        let windows = Arc::clone(&self.windows);
        let window = self.window;
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let before = windows.len();
                        windows.retain(|_, w| now.duration_since(w.opened_at) < window);
                        // A concurrent check may insert between len() and retain.
                        let swept = before.saturating_sub(windows.len());
                        if swept > 0 {
                            debug!(swept, "rate limiter swept expired windows");
                        }
                    }
                }
            }
        });
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }
}

/// Extracts the throttle key from proxy headers: first address in
/// `x-forwarded-for`, then `x-real-ip`, then `"unknown"`.
pub fn rate_limit_key(header: impl Fn(&str) -> Option<String>) -> String {
    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    header("x-real-ip").unwrap_or_else(|| "unknown".to_string())
}
