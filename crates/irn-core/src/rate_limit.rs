//! Sliding-window rate limiting.
//!
//! The window is a list of request timestamps. Timestamps older than the
//! window are dropped before counting; a request is admitted only while the
//! remaining count is below the limit, and a rejected request is not recorded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Limit and window for one class of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum requests per window. Zero denies everything.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// `max_requests` per minute.
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Admitted and recorded.
    Allowed {
        /// Requests left in the current window after this one.
        remaining: u32,
    },
    /// Rejected; nothing recorded.
    Limited {
        /// Time until the oldest request leaves the window.
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Timestamps of admitted requests, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlidingWindow {
    requests: Vec<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently recorded (including stale ones not yet pruned).
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drop timestamps that have left the window ending at `now`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = window_start(now, window);
        self.requests.retain(|&t| t > cutoff);
    }

    /// Check whether a request is allowed at `now` and record it if so.
    pub fn check_and_record(&mut self, now: DateTime<Utc>, policy: RateLimitPolicy) -> RateLimitDecision {
        self.prune(now, policy.window);

        if self.requests.len() >= policy.max_requests as usize {
            let retry_after = match self.requests.first() {
                Some(&oldest) => {
                    let elapsed = (now - oldest).to_std().unwrap_or(Duration::ZERO);
                    policy.window.saturating_sub(elapsed)
                }
                None => policy.window,
            };
            return RateLimitDecision::Limited { retry_after };
        }

        self.requests.push(now);
        RateLimitDecision::Allowed {
            remaining: policy.max_requests - self.requests.len() as u32,
        }
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sixtieth_allowed_sixty_first_limited() {
        let policy = RateLimitPolicy::per_minute(60);
        let mut window = SlidingWindow::new();

        for i in 0..60 {
            let now = t0() + chrono::Duration::milliseconds(i * 100);
            assert!(window.check_and_record(now, policy).is_allowed(), "request {} rejected", i + 1);
        }

        let now = t0() + chrono::Duration::seconds(10);
        match window.check_and_record(now, policy) {
            RateLimitDecision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(50)),
            other => panic!("expected limited, got {other:?}"),
        }
        assert_eq!(window.len(), 60);
    }

    #[test]
    fn test_capacity_frees_as_window_slides() {
        let policy = RateLimitPolicy::per_minute(60);
        let mut window = SlidingWindow::new();
        for i in 0..60 {
            window.check_and_record(t0() + chrono::Duration::seconds(i), policy);
        }

        assert!(!window.check_and_record(t0() + chrono::Duration::seconds(59), policy).is_allowed());
        // The first request (t0) is exactly one window old at t0+60s.
        assert!(window.check_and_record(t0() + chrono::Duration::seconds(60), policy).is_allowed());
        assert!(!window.check_and_record(t0() + chrono::Duration::seconds(60), policy).is_allowed());
    }

    #[test]
    fn test_remaining_counts_down() {
        let policy = RateLimitPolicy::per_minute(3);
        let mut window = SlidingWindow::new();
        assert_eq!(window.check_and_record(t0(), policy), RateLimitDecision::Allowed { remaining: 2 });
        assert_eq!(window.check_and_record(t0(), policy), RateLimitDecision::Allowed { remaining: 1 });
        assert_eq!(window.check_and_record(t0(), policy), RateLimitDecision::Allowed { remaining: 0 });
        assert!(!window.check_and_record(t0(), policy).is_allowed());
    }

    #[test]
    fn test_zero_limit_denies() {
        let mut window = SlidingWindow::new();
        assert!(!window.check_and_record(t0(), RateLimitPolicy::per_minute(0)).is_allowed());
        assert!(window.is_empty());
    }
}
