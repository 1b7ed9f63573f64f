//! Per-target circuit breaker.
//!
//! Classic closed/open/half-open state machine with a single serialized
//! trial request while half-open and optional exponential backoff on
//! successive re-opens.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Raised when a target's breaker refuses the request.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker open for '{key}' (retry in {retry_after:?})")]
pub struct BreakerOpenError {
    pub key: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Base cooldown before a half-open trial is allowed.
    pub cooldown_secs: f64,
    /// Cooldown multiplier applied per successive re-open. 1.0 disables the
    /// exponential backoff.
    pub reopen_backoff_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300.0,
            reopen_backoff_factor: 2.0,
        }
    }
}

/// Observable breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    reopen_count: u32,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            opened_at: None,
            reopen_count: 0,
            trial_in_flight: false,
        }
    }

    fn cooldown(&self, config: &BreakerConfig) -> Duration {
        let factor = config
            .reopen_backoff_factor
            .max(1.0)
            .powi(self.reopen_count.saturating_sub(1) as i32);
        Duration::from_secs_f64(config.cooldown_secs * factor)
    }
}

/// Outcome carrier handed out by [`CircuitBreaker::try_acquire`].
///
/// Exactly one of [`succeed`](BreakerPass::succeed) or
/// [`fail`](BreakerPass::fail) should be called per pass. Dropping the pass
/// without an outcome releases a half-open trial slot instead of leaving it
/// stuck, which keeps cancellation at await points safe.
#[derive(Debug)]
pub struct BreakerPass<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    recorded: bool,
}

impl BreakerPass<'_> {
    pub fn succeed(mut self) {
        self.recorded = true;
        self.breaker.record_success(&self.key);
    }

    pub fn fail(mut self) {
        self.recorded = true;
        self.breaker.record_failure_at(&self.key, Instant::now());
    }

    #[cfg(test)]
    fn fail_at(mut self, now: Instant) {
        self.recorded = true;
        self.breaker.record_failure_at(&self.key, now);
    }
}

impl Drop for BreakerPass<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release_trial(&self.key);
        }
    }
}

/// Failure tracker keyed by target.
///
/// The key map is fixed at construction; each entry mutates under its own
/// lock so unrelated targets never contend.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: HashMap<String, Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new<I>(config: BreakerConfig, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let states = keys
            .into_iter()
            .map(|key| (key, Mutex::new(BreakerState::new())))
            .collect();
        Self { config, states }
    }

    /// Ask to pass one request through the breaker for `key`.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerPass<'_>, BreakerOpenError> {
        self.try_acquire_at(key, Instant::now())
    }

    pub(crate) fn try_acquire_at(
        &self,
        key: &str,
        now: Instant,
    ) -> Result<BreakerPass<'_>, BreakerOpenError> {
        let Some(entry) = self.states.get(key) else {
            // Unknown keys pass through unchecked; validation keeps the tier
            // set and the key set aligned.
            return Ok(BreakerPass {
                breaker: self,
                key: key.to_string(),
                recorded: false,
            });
        };

        let mut state = entry.lock().expect("breaker lock poisoned");
        match state.phase {
            BreakerPhase::Closed => {}
            BreakerPhase::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let cooldown = state.cooldown(&self.config);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < cooldown {
                    return Err(BreakerOpenError {
                        key: key.to_string(),
                        retry_after: cooldown - elapsed,
                    });
                }
                // Cooldown elapsed: admit exactly one trial request.
                state.phase = BreakerPhase::HalfOpen;
                state.trial_in_flight = true;
            }
            BreakerPhase::HalfOpen => {
                if state.trial_in_flight {
                    // Another caller owns the trial slot; behave as open.
                    return Err(BreakerOpenError {
                        key: key.to_string(),
                        retry_after: Duration::ZERO,
                    });
                }
                state.trial_in_flight = true;
            }
        }

        Ok(BreakerPass {
            breaker: self,
            key: key.to_string(),
            recorded: false,
        })
    }

    fn record_success(&self, key: &str) {
        let Some(entry) = self.states.get(key) else {
            return;
        };
        let mut state = entry.lock().expect("breaker lock poisoned");
        match state.phase {
            BreakerPhase::HalfOpen => {
                log::info!("breaker '{key}' closed after successful trial");
                *state = BreakerState::new();
            }
            _ => {
                state.consecutive_failures = 0;
            }
        }
    }

    fn record_failure_at(&self, key: &str, now: Instant) {
        let Some(entry) = self.states.get(key) else {
            return;
        };
        let mut state = entry.lock().expect("breaker lock poisoned");
        match state.phase {
            BreakerPhase::HalfOpen => {
                state.phase = BreakerPhase::Open;
                state.opened_at = Some(now);
                state.reopen_count = state.reopen_count.saturating_add(1);
                state.trial_in_flight = false;
                log::warn!(
                    "breaker '{key}' re-opened after failed trial (re-open #{})",
                    state.reopen_count
                );
            }
            BreakerPhase::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.phase = BreakerPhase::Open;
                    state.opened_at = Some(now);
                    state.reopen_count = 1;
                    log::warn!(
                        "breaker '{key}' opened after {} consecutive failures",
                        state.consecutive_failures
                    );
                }
            }
            BreakerPhase::Open => {}
        }
    }

    fn release_trial(&self, key: &str) {
        let Some(entry) = self.states.get(key) else {
            return;
        };
        let mut state = entry.lock().expect("breaker lock poisoned");
        if state.phase == BreakerPhase::HalfOpen {
            state.trial_in_flight = false;
        }
    }

    pub fn phase(&self, key: &str) -> Option<BreakerPhase> {
        self.states
            .get(key)
            .map(|entry| entry.lock().expect("breaker lock poisoned").phase)
    }

    pub fn consecutive_failures(&self, key: &str) -> Option<u32> {
        self.states.get(key).map(|entry| {
            entry
                .lock()
                .expect("breaker lock poisoned")
                .consecutive_failures
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_secs,
                reopen_backoff_factor: 2.0,
            },
            ["api".to_string()],
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(3, 60.0);
        let now = Instant::now();
        for _ in 0..3 {
            breaker.try_acquire_at("api", now).unwrap().fail_at(now);
        }
        assert_eq!(breaker.phase("api"), Some(BreakerPhase::Open));
        assert!(breaker.try_acquire_at("api", now).is_err());
    }

    #[test]
    fn half_open_trial_success_closes_and_resets() {
        let breaker = breaker(2, 10.0);
        let now = Instant::now();
        breaker.try_acquire_at("api", now).unwrap().fail_at(now);
        breaker.try_acquire_at("api", now).unwrap().fail_at(now);
        assert_eq!(breaker.phase("api"), Some(BreakerPhase::Open));

        let later = now + Duration::from_secs(11);
        let pass = breaker.try_acquire_at("api", later).unwrap();
        assert_eq!(breaker.phase("api"), Some(BreakerPhase::HalfOpen));
        pass.succeed();

        assert_eq!(breaker.phase("api"), Some(BreakerPhase::Closed));
        assert_eq!(breaker.consecutive_failures("api"), Some(0));
    }

    #[test]
    fn half_open_trial_failure_reopens() {
        let breaker = breaker(1, 10.0);
        let now = Instant::now();
        breaker.try_acquire_at("api", now).unwrap().fail_at(now);

        let later = now + Duration::from_secs(11);
        let pass = breaker.try_acquire_at("api", later).unwrap();
        pass.fail_at(later);
        assert_eq!(breaker.phase("api"), Some(BreakerPhase::Open));

        // Second re-open doubles the cooldown: 10s base is not enough now.
        let retry = later + Duration::from_secs(11);
        assert!(breaker.try_acquire_at("api", retry).is_err());
        let retry = later + Duration::from_secs(21);
        assert!(breaker.try_acquire_at("api", retry).is_ok());
    }

    #[test]
    fn half_open_serializes_concurrent_trials() {
        let breaker = breaker(1, 5.0);
        let now = Instant::now();
        breaker.try_acquire_at("api", now).unwrap().fail_at(now);

        let later = now + Duration::from_secs(6);
        let first = breaker.try_acquire_at("api", later).unwrap();
        // A second caller during the trial is short-circuited as if open.
        assert!(breaker.try_acquire_at("api", later).is_err());

        // Dropping the pass without an outcome releases the trial slot.
        drop(first);
        assert!(breaker.try_acquire_at("api", later).is_ok());
    }
}
