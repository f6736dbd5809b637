//! Bet Rate Limiting
//!
//! One token bucket per player. A bet spends one token; tokens refill
//! continuously up to the burst capacity.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::game::state::PlayerId;

/// Bet rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Bets allowed back to back.
    pub burst_capacity: u32,
    /// Tokens regained per second.
    pub bets_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 5,
            bets_per_second: 5,
        }
    }
}

impl RateLimitConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let per_second = std::env::var("DICE_BETS_PER_SECOND")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &u32| n > 0)
            .unwrap_or(defaults.bets_per_second);
        Self {
            burst_capacity: per_second,
            bets_per_second: per_second,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_capacity as f64,
            last_refill: now,
            capacity: config.burst_capacity as f64,
            refill_rate: config.bets_per_second as f64,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn is_full(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.capacity
    }
}

/// Per-player bet limiter.
#[derive(Debug)]
pub struct BetRateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<BTreeMap<PlayerId, TokenBucket>>,
}

impl BetRateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Spend one token for `player`. False means the bet must be refused.
    pub async fn try_acquire(&self, player: PlayerId) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let allowed = buckets
            .entry(player)
            .or_insert_with(|| TokenBucket::new(self.config, now))
            .try_consume(now);

        if !allowed {
            debug!(player = %player.short(), "Bet rate limited");
        }
        allowed
    }

    /// Forget players whose bucket has refilled. Returns how many were dropped.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_full(now));
        before - buckets.len()
    }

    /// Players currently tracked.
    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

impl Default for BetRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
