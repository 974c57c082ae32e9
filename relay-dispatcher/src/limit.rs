//! The two rate limit mechanisms: the process-wide send window and the
//! per-bucket quota snapshot the provider reports through response headers.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;

use crate::error::WebhookError;

/// The provider's reset headers run early; following them exactly still
/// produces excessive 429s, so every reset is padded.
pub const RESET_PADDING: Duration = Duration::from_secs(2);

const WINDOW_LENGTH: Duration = Duration::from_secs(1);

struct Window {
    requests: u32,
    started: Instant,
}

/// Sliding one-second counter shared by every sender in the process. Keeps
/// the relay under the operator-configured ceiling no matter how many bucket
/// workers are live.
pub struct LocalWindow {
    max_per_second: u32,
    inner: Mutex<Window>,
}

impl LocalWindow {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            inner: Mutex::new(Window {
                requests: 0,
                started: Instant::now(),
            }),
        }
    }

    /// Admit one request, or fail when the current window is full.
    pub fn acquire(&self) -> Result<(), WebhookError> {
        self.acquire_at(0, Instant::now())
    }

    /// Burn a full window starting now. Used when the provider reports a
    /// global rate limit, so every sender backs off together. A global 429
    /// always lands mid-window (the request that saw it was admitted
    /// moments ago), so this bypasses the rollover check entirely.
    pub fn exhaust(&self) {
        let mut window = self.inner.lock().expect("poisoned local window mutex");
        window.requests = self.max_per_second;
        window.started = Instant::now();
    }

    fn acquire_at(&self, seed: u32, now: Instant) -> Result<(), WebhookError> {
        let mut window = self.inner.lock().expect("poisoned local window mutex");

        if now.duration_since(window.started) >= WINDOW_LENGTH {
            window.requests = seed;
            window.started = now;
        }

        if window.requests >= self.max_per_second {
            return Err(WebhookError::LocalRateLimitExceeded);
        }

        window.requests += 1;
        Ok(())
    }
}

/// One bucket's quota as last reported by the provider. Owned by the bucket's
/// worker; only mutated after a response.
#[derive(Debug, Default)]
pub struct RateLimitState {
    pub remaining: i64,
    pub limit: i64,
    /// `None` behaves as "already past": the next loop iteration resets.
    pub reset_at: Option<SystemTime>,
    pub reset_after: Duration,
    pub limited: bool,
}

impl RateLimitState {
    /// Called at the top of the worker loop. Once the reset time passes the
    /// bucket gets exactly one probe request; its response refreshes the
    /// quota from headers.
    pub fn maybe_reset(&mut self, now: SystemTime) {
        let expired = self.reset_at.map_or(true, |at| now > at);
        if expired {
            self.limited = false;
            self.remaining = 1;
            self.reset_at = None;
            self.reset_after = Duration::ZERO;
        }
    }

    pub fn time_until_reset(&self, now: SystemTime) -> Duration {
        self.reset_at
            .and_then(|at| at.duration_since(now).ok())
            .unwrap_or(Duration::ZERO)
    }

    /// How long a retry should wait. Zero unless the provider limited us.
    pub fn rate_limit_sleep(&self, now: SystemTime) -> Duration {
        if self.limited {
            self.time_until_reset(now)
        } else {
            Duration::ZERO
        }
    }

    /// Refresh the snapshot from rate limit response headers. Missing or
    /// unparseable headers leave the previous values untouched.
    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        if let Some(remaining) = header_i64(headers, "X-RateLimit-Remaining") {
            self.remaining = remaining;
        }
        if let Some(limit) = header_i64(headers, "X-RateLimit-Limit") {
            self.limit = limit;
        }
        if let Some(reset) = header_i64(headers, "X-RateLimit-Reset") {
            self.reset_at =
                Some(UNIX_EPOCH + Duration::from_secs(reset.max(0) as u64) + RESET_PADDING);
        }
        if let Some(reset_after) = header_f64(headers, "X-RateLimit-Reset-After") {
            self.reset_after = Duration::from_secs_f64(reset_after.max(0.0)) + RESET_PADDING;
        }
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admits_up_to_the_ceiling() {
        let window = LocalWindow::new(45);
        let now = Instant::now();

        for _ in 0..45 {
            window.acquire_at(0, now).expect("should admit");
        }
        assert!(matches!(
            window.acquire_at(0, now),
            Err(WebhookError::LocalRateLimitExceeded)
        ));
    }

    #[test]
    fn window_rolls_over_after_one_second() {
        let window = LocalWindow::new(2);
        let now = Instant::now();

        window.acquire_at(0, now).unwrap();
        window.acquire_at(0, now).unwrap();
        assert!(window.acquire_at(0, now).is_err());

        let later = now + Duration::from_secs(1);
        window.acquire_at(0, later).expect("fresh window");
    }

    #[test]
    fn exhaust_blocks_until_the_window_rolls() {
        let window = LocalWindow::new(10);
        let now = Instant::now();

        window.exhaust();
        assert!(window.acquire_at(0, now).is_err());

        let later = now + Duration::from_secs(2);
        assert!(window.acquire_at(0, later).is_ok());
    }

    #[test]
    fn exhaust_forces_the_ceiling_mid_window() {
        let window = LocalWindow::new(45);
        let now = Instant::now();

        // A fresh window with admissions in flight, like the request that
        // just observed the global 429.
        window.acquire_at(0, now).unwrap();
        window.exhaust();

        assert!(matches!(
            window.acquire_at(0, now),
            Err(WebhookError::LocalRateLimitExceeded)
        ));
    }

    #[test]
    fn reset_grants_one_probe_request() {
        let mut state = RateLimitState {
            remaining: 0,
            limit: 5,
            reset_at: Some(SystemTime::now() - Duration::from_secs(1)),
            reset_after: Duration::from_secs(10),
            limited: true,
        };

        state.maybe_reset(SystemTime::now());

        assert!(!state.limited);
        assert_eq!(state.remaining, 1);
        assert_eq!(state.reset_at, None);
        assert_eq!(state.reset_after, Duration::ZERO);
    }

    #[test]
    fn future_reset_is_left_alone() {
        let reset_at = SystemTime::now() + Duration::from_secs(30);
        let mut state = RateLimitState {
            remaining: 0,
            limit: 5,
            reset_at: Some(reset_at),
            reset_after: Duration::from_secs(30),
            limited: true,
        };

        state.maybe_reset(SystemTime::now());

        assert!(state.limited);
        assert_eq!(state.reset_at, Some(reset_at));
    }

    #[test]
    fn rate_limit_sleep_is_zero_unless_limited() {
        let now = SystemTime::now();
        let mut state = RateLimitState {
            reset_at: Some(now + Duration::from_secs(10)),
            ..Default::default()
        };

        assert_eq!(state.rate_limit_sleep(now), Duration::ZERO);

        state.limited = true;
        let sleep = state.rate_limit_sleep(now);
        assert!(sleep > Duration::from_secs(9) && sleep <= Duration::from_secs(10));
    }

    #[test]
    fn headers_update_the_snapshot_with_padding() {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", "3".parse().unwrap());
        headers.insert("X-RateLimit-Limit", "5".parse().unwrap());
        headers.insert("X-RateLimit-Reset", "1000".parse().unwrap());
        headers.insert("X-RateLimit-Reset-After", "10.5".parse().unwrap());

        let mut state = RateLimitState::default();
        state.update_from_headers(&headers);

        assert_eq!(state.remaining, 3);
        assert_eq!(state.limit, 5);
        assert_eq!(
            state.reset_at,
            Some(UNIX_EPOCH + Duration::from_secs(1002))
        );
        assert_eq!(state.reset_after, Duration::from_secs_f64(12.5));
    }

    #[test]
    fn unparseable_headers_leave_prior_values() {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", "many".parse().unwrap());

        let mut state = RateLimitState {
            remaining: 4,
            ..Default::default()
        };
        state.update_from_headers(&headers);

        assert_eq!(state.remaining, 4);
        assert_eq!(state.reset_at, None);
    }
}
