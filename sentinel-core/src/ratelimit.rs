//! In-process fixed-window rate limiting.
//!
//! Fixed-window counters with a burst allowance. The distributed variant
//! lives in the broker crate and shares these parameter and decision
//! types. Rate limiting is a mitigation, not a trust boundary — the
//! policy engine is the trust boundary — which is why the distributed
//! backend fails open and this one never blocks on anything.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Limiter parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
    /// Extra requests admitted on top of `requests_per_window` within one
    /// window.
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn limit(&self) -> u32 {
        self.requests_per_window.saturating_add(self.burst_size)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            requests_per_window: 10,
            window: Duration::from_secs(60),
            burst_size: 5,
        }
    }
}

/// Outcome of a limiter check. Denials carry the back-off hint the caller
/// is entitled to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Single-process limiter keyed by an opaque subject string.
pub struct MemoryRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl MemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        MemoryRateLimiter {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-count for one request. Short critical section; callers
    /// never hold this lock across an await.
    pub fn check(&self, subject: &str) -> RateLimitDecision {
        self.check_at(subject, Instant::now())
    }

    fn check_at(&self, subject: &str, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock();
        let state = windows.entry(subject.to_string()).or_insert(WindowState {
            window_start: now,
            count: 0,
        });

        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.config.limit() {
            let elapsed = now.duration_since(state.window_start);
            let remaining = self.config.window.saturating_sub(elapsed);
            // Round up so "retry in 0s" never lies to the caller.
            let retry_after_secs = remaining.as_secs().max(1);
            return RateLimitDecision::Denied { retry_after_secs };
        }

        state.count += 1;
        RateLimitDecision::Allowed
    }

    /// Drop windows that ended long ago. Called opportunistically by
    /// long-lived hosts to bound the table.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.windows
            .lock()
            .retain(|_, s| now.duration_since(s.window_start) < window * 2);
    }
}
