// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Token bucket rate limiter.
//!
//! Classic leaky bucket with capacity equal to the configured peak rate
//! (one second of burst) and refill on access. A datagram larger than
//! the whole capacity is still admitted whenever the level is positive -
//! the level then goes negative and subsequent sends wait it out.
//! Without that rule a rate below the MTU could never send at all.

use std::time::{Duration, Instant};

/// Token bucket rate limiter. Tokens are bytes, IP overhead included.
#[derive(Debug)]
pub struct TokenBucket {
    /// Current level; negative after an oversized send.
    tokens: i64,

    /// Maximum level (burst size in bytes), equal to the rate.
    capacity: i64,

    /// Refill rate (bytes per second).
    rate_bps: u64,

    /// Last refill timestamp.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket starting full.
    ///
    /// `rate_bps` of zero disables limiting entirely.
    pub fn new(rate_bps: u64) -> Self {
        Self {
            tokens: rate_bps as i64,
            capacity: rate_bps as i64,
            rate_bps,
            last_refill: Instant::now(),
        }
    }

    /// Whether a rate is configured at all.
    pub fn is_limited(&self) -> bool {
        self.rate_bps > 0
    }

    /// Configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate_bps
    }

    /// Update the rate; the level carries over, clamped to the new burst.
    pub fn set_rate(&mut self, rate_bps: u64) {
        self.refill();
        self.rate_bps = rate_bps;
        self.capacity = rate_bps as i64;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Try to consume tokens for one datagram of `bytes` on the wire.
    ///
    /// Returns `true` when admitted. An oversized datagram (larger than
    /// the full capacity) is admitted while the level is positive.
    pub fn try_consume(&mut self, bytes: u64) -> bool {
        if self.rate_bps == 0 {
            return true;
        }
        self.refill();

        let needed = bytes as i64;
        if needed > self.capacity {
            if self.tokens > 0 {
                self.tokens -= needed;
                true
            } else {
                false
            }
        } else if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Time until a datagram of `bytes` would be admitted.
    ///
    /// Returns `Duration::ZERO` when it would be admitted now. Backs the
    /// RATE_REMAIN query and the blocking-send sleep.
    pub fn time_until_available(&mut self, bytes: u64) -> Duration {
        if self.rate_bps == 0 {
            return Duration::ZERO;
        }
        self.refill();

        let needed = bytes as i64;
        let deficit = if needed > self.capacity {
            // Oversized: admitted as soon as the level is positive.
            1 - self.tokens
        } else {
            needed - self.tokens
        };
        if deficit <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit as f64 / self.rate_bps as f64)
    }

    /// Refill based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let add = (elapsed.as_secs_f64() * self.rate_bps as f64) as i64;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.capacity);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let mut bucket = TokenBucket::new(10_000);
        assert!(bucket.try_consume(10_000));
        assert!(!bucket.try_consume(1), "bucket must be empty after burst");
    }

    #[test]
    fn test_bucket_unlimited_when_rate_zero() {
        let mut bucket = TokenBucket::new(0);
        assert!(!bucket.is_limited());
        assert!(bucket.try_consume(u64::MAX / 2));
        assert_eq!(bucket.time_until_available(1_000_000), Duration::ZERO);
    }

    #[test]
    fn test_bucket_oversized_send_goes_negative() {
        // Capacity 1000 bytes/s, full. A 2000-byte datagram is admitted
        // once, then the next send waits out the deficit (~1 s).
        let mut bucket = TokenBucket::new(1000);
        assert!(bucket.try_consume(2000), "first oversized send is admitted");
        assert!(!bucket.try_consume(2000), "second is rate-limited");

        let wait = bucket.time_until_available(2000);
        assert!(
            wait > Duration::from_millis(900) && wait < Duration::from_millis(1100),
            "RATE_REMAIN must be about one second, got {:?}",
            wait
        );
    }

    #[test]
    fn test_bucket_time_until_available_partial() {
        let mut bucket = TokenBucket::new(1000);
        assert!(bucket.try_consume(900));
        let wait = bucket.time_until_available(200);
        assert!(
            wait > Duration::ZERO && wait < Duration::from_millis(200),
            "100-byte deficit at 1000 B/s is about 100 ms, got {:?}",
            wait
        );
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1_000_000);
        assert!(bucket.try_consume(1_000_000));
        std::thread::sleep(Duration::from_millis(20));
        assert!(
            bucket.try_consume(1_000),
            "20 ms at 1 MB/s refills well over 1 KB"
        );
    }

    #[test]
    fn test_bucket_set_rate_clamps_level() {
        let mut bucket = TokenBucket::new(10_000);
        bucket.set_rate(100);
        assert!(bucket.try_consume(100));
        assert!(!bucket.try_consume(100));
    }
}
