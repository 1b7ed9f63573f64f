//! Token-bucket rate limiting with human-like jitter.
//!
//! One bucket per client tier. Refill is computed lazily on each acquire,
//! so there is no background timer; the caller suspends for the returned
//! wait instead of the limiter blocking.

use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Jitter envelope layered on top of the raw bucket wait so inter-request
/// timing never turns perfectly periodic.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct JitterConfig {
    /// Base delay applied before every attempt, in seconds.
    pub base_delay_secs: f64,
    /// Standard deviation of the gaussian noise term, in seconds.
    pub noise_std_secs: f64,
    /// Noise is truncated to ±this bound, in seconds.
    pub noise_clamp_secs: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            noise_std_secs: 0.6,
            noise_clamp_secs: 2.0,
        }
    }
}

impl JitterConfig {
    /// Draw one human-like delay: base ± truncated gaussian noise, scaled by
    /// the risk-tier multiplier. Never negative.
    pub fn sample(&self, multiplier: f64) -> Duration {
        let mut rng = rand::thread_rng();
        let noise = gaussian(&mut rng) * self.noise_std_secs;
        let noise = noise.clamp(-self.noise_clamp_secs, self.noise_clamp_secs);
        let delay = (self.base_delay_secs + noise) * multiplier.max(0.0);
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Standard normal sample via Box-Muller.
fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
}

impl BucketState {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            rate,
            burst,
        }
    }

    /// Refill up to elapsed × rate (capped at burst), then either consume one
    /// token or report how long until one becomes available.
    fn acquire(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Per-tier token buckets.
///
/// The bucket map is fixed at construction from the tier configuration;
/// only the individual bucket states mutate, each under its own lock so
/// unrelated tiers never serialize on each other.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    buckets: HashMap<String, Mutex<BucketState>>,
}

impl TokenBucketLimiter {
    pub fn new<I>(tiers: I) -> Self
    where
        I: IntoIterator<Item = (String, f64, f64)>,
    {
        let now = Instant::now();
        let buckets = tiers
            .into_iter()
            .map(|(name, rate, burst)| (name, Mutex::new(BucketState::new(rate, burst, now))))
            .collect();
        Self { buckets }
    }

    /// Try to take one token from the tier's bucket.
    ///
    /// Returns [`Duration::ZERO`] when a token was consumed, otherwise the
    /// time until one token will be available. The limiter never sleeps; the
    /// caller owns the suspension.
    pub fn acquire(&self, tier: &str) -> Duration {
        self.acquire_at(tier, Instant::now())
    }

    pub(crate) fn acquire_at(&self, tier: &str, now: Instant) -> Duration {
        match self.buckets.get(tier) {
            Some(bucket) => {
                let mut state = bucket.lock().expect("bucket lock poisoned");
                state.acquire(now)
            }
            // Unknown tiers are not rate limited; configuration validation
            // keeps this unreachable in practice.
            None => Duration::ZERO,
        }
    }
}
