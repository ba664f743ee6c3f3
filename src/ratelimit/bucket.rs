//! Token bucket admission primitive.

use tokio::time::Instant;

use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// Validated refill rate and burst size for a [`TokenBucket`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    rate: f64,
    capacity: u32,
}

impl Quota {
    /// Create a quota, rejecting a non-positive or non-finite rate and a zero capacity.
    pub fn new(rate: f64, capacity: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TollgateError::Config(format!(
                "rate must be a positive number, got {}",
                rate
            )));
        }
        if capacity == 0 {
            return Err(TollgateError::Config(
                "capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self { rate, capacity })
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl TryFrom<&LimiterConfig> for Quota {
    type Error = TollgateError;

    fn try_from(config: &LimiterConfig) -> Result<Self> {
        Quota::new(config.rate, config.capacity)
    }
}

/// A continuously refilling token counter for a single key.
///
/// Tokens are fractional internally; one admission costs exactly one token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    quota: Quota,
    /// Currently available tokens, always within `[0, capacity]`
    tokens: f64,
    /// Instant up to which elapsed time has been credited
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(quota: Quota) -> Self {
        Self::new_at(quota, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            tokens: quota.capacity as f64,
            last_refill: now,
        }
    }

    /// Try to take one token at the current instant.
    ///
    /// Returns `true` if the unit of work is admitted.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Try to take one token at `now`.
    ///
    /// An instant earlier than the last refill credits nothing and does not
    /// move the refill clock backwards.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without mutating the bucket.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * self.quota.rate).min(self.capacity())
    }

    /// Tokens available at the current instant.
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    /// The quota this bucket enforces.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    fn capacity(&self) -> f64 {
        self.quota.capacity as f64
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        self.tokens = self.available_at(now);
        self.last_refill = now;
    }
}
