//! Per-channel provider rate limiting.
//!
//! Token bucket per channel, refilled at `rate_limit_per_minute / 60` tokens
//! per second with a two-second burst.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::domain::Channel;

/// Token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Bucket for a per-minute cap. Returns `None` for an unlimited (zero) cap.
    pub fn per_minute(limit: u32) -> Option<Self> {
        if limit == 0 {
            return None;
        }
        let refill_rate = f64::from(limit) / 60.0;
        let max_tokens = (refill_rate * 2.0).ceil().max(1.0);
        Some(Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        })
    }

    /// Take a token, or report how long until one is available.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Rate limiters keyed by channel.
#[derive(Debug, Default)]
pub struct ChannelRateLimiter {
    limiters: Mutex<HashMap<Channel, RateLimiter>>,
}

impl ChannelRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a token for `channel`, creating its bucket from `limit_per_minute`
    /// on first use. `Err` carries the wait until the next token.
    pub fn try_acquire(&self, channel: Channel, limit_per_minute: u32) -> Result<(), Duration> {
        let mut limiters = self.limiters.lock();
        let limiter = match limiters.entry(channel) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match RateLimiter::per_minute(limit_per_minute) {
                Some(limiter) => e.insert(limiter),
                None => return Ok(()),
            },
        };
        let result = limiter.try_acquire();
        if let Err(wait) = result {
            trace!(channel = %channel, wait = ?wait, "Provider rate limited");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_is_unlimited() {
        assert!(RateLimiter::per_minute(0).is_none());
        let limiter = ChannelRateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.try_acquire(Channel::Email, 0).is_ok());
        }
    }

    #[test]
    fn test_burst_then_limited() {
        // 60/min = 1 token/sec, burst of 2
        let limiter = ChannelRateLimiter::new();
        assert!(limiter.try_acquire(Channel::Sms, 60).is_ok());
        assert!(limiter.try_acquire(Channel::Sms, 60).is_ok());
        let wait = limiter.try_acquire(Channel::Sms, 60).unwrap_err();
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn test_channels_are_independent() {
        let limiter = ChannelRateLimiter::new();
        assert!(limiter.try_acquire(Channel::Sms, 1).is_ok());
        assert!(limiter.try_acquire(Channel::Sms, 1).is_err());
        assert!(limiter.try_acquire(Channel::Push, 1).is_ok());
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let mut bucket = RateLimiter::per_minute(6000).unwrap();
        while bucket.try_acquire().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bucket.available_tokens() >= 1.0);
    }
}
