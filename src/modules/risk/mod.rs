//! Risk scoring over observed request outcomes.
//!
//! Aggregates status-code streaks, challenge frequency, and error rate over
//! a sliding window into a continuous score and a discrete policy tier. The
//! tiers modulate pacing rather than hard-failing until the emergency
//! threshold is crossed.

use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::modules::stop::{EmergencyStop, StopReason};

/// Terminal classification of one tier attempt, fed back by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Http403,
    Http429,
    Challenge,
    /// A circuit breaker refused or re-opened instead of attempting.
    BreakerTrip,
    /// Network failures, timeouts, and status codes with no dedicated signal.
    NetworkError,
}

impl Outcome {
    fn is_error(self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

/// Relative weights of the four risk signals. They should sum to roughly
/// 1.0 so the score stays interpretable, but the monitor clamps regardless.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RiskWeights {
    pub consecutive_403: f64,
    pub consecutive_429: f64,
    pub challenge_frequency: f64,
    pub error_rate: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            consecutive_403: 0.30,
            consecutive_429: 0.25,
            challenge_frequency: 0.25,
            error_rate: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RiskConfig {
    /// Sliding window length in seconds.
    pub window_secs: f64,
    pub weights: RiskWeights,
    /// Score below this is Normal.
    pub warning_threshold: f64,
    /// Score at or above this is Paused.
    pub critical_threshold: f64,
    /// Score at or above this is Stopped and trips the kill switch.
    pub emergency_threshold: f64,
    /// Streak length at which the 403/429 signals saturate to 1.0.
    pub streak_saturation: u32,
    /// Challenge count in the window at which that signal saturates.
    pub challenge_saturation: u32,
    /// Consecutive challenges that trip the emergency stop outright.
    pub challenge_ceiling: u32,
    /// Window error rate that trips the emergency stop outright.
    pub error_rate_ceiling: f64,
    /// Minimum window population before the error-rate ceiling applies, so a
    /// handful of early failures cannot latch the kill switch on their own.
    pub min_window_samples: usize,
    /// Delay multiplier applied in the Cautious tier.
    pub cautious_multiplier: f64,
    /// Hold applied before each request while Paused, in seconds.
    pub pause_hold_secs: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            window_secs: 1800.0,
            weights: RiskWeights::default(),
            warning_threshold: 0.3,
            critical_threshold: 0.5,
            emergency_threshold: 0.8,
            streak_saturation: 5,
            challenge_saturation: 3,
            challenge_ceiling: 3,
            error_rate_ceiling: 0.5,
            min_window_samples: 10,
            cautious_multiplier: 1.5,
            pause_hold_secs: 120.0,
        }
    }
}

/// Discrete policy tier derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    Normal,
    Cautious,
    Paused,
    Stopped,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Copy)]
pub struct RiskSnapshot {
    pub score: f64,
    pub tier: RiskTier,
    pub consecutive_403: u32,
    pub consecutive_429: u32,
    pub consecutive_challenges: u32,
    pub window_challenges: u32,
    pub window_error_rate: f64,
    pub window_len: usize,
}

#[derive(Debug)]
struct RiskState {
    window: VecDeque<(Instant, Outcome)>,
    consecutive_403: u32,
    consecutive_429: u32,
    consecutive_challenges: u32,
}

impl RiskState {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(256),
            consecutive_403: 0,
            consecutive_429: 0,
            consecutive_challenges: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((ts, _)) = self.window.front() {
            if now.saturating_duration_since(*ts) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        // Streaks only roll back via success or window expiry; an empty
        // window means every contributing observation has aged out.
        if self.window.is_empty() {
            self.consecutive_403 = 0;
            self.consecutive_429 = 0;
            self.consecutive_challenges = 0;
        }
    }
}

/// Sliding-window risk aggregator.
///
/// Holds the shared [`EmergencyStop`] so a crossing of any hard ceiling
/// latches the kill switch at observation time, not on the next poll.
#[derive(Debug)]
pub struct RiskMonitor {
    config: RiskConfig,
    stop: Arc<EmergencyStop>,
    state: Mutex<RiskState>,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig, stop: Arc<EmergencyStop>) -> Self {
        Self {
            config,
            stop,
            state: Mutex::new(RiskState::new()),
        }
    }

    /// Record one observed outcome and return the recomputed snapshot.
    pub fn observe(&self, outcome: Outcome) -> RiskSnapshot {
        self.observe_at(outcome, Instant::now())
    }

    pub(crate) fn observe_at(&self, outcome: Outcome, now: Instant) -> RiskSnapshot {
        let window = Duration::from_secs_f64(self.config.window_secs);
        let snapshot = {
            let mut state = self.state.lock().expect("risk lock poisoned");
            state.prune(now, window);
            state.window.push_back((now, outcome));

            match outcome {
                Outcome::Success => {
                    state.consecutive_403 = 0;
                    state.consecutive_429 = 0;
                    state.consecutive_challenges = 0;
                }
                Outcome::Http403 => {
                    state.consecutive_403 = state.consecutive_403.saturating_add(1);
                }
                Outcome::Http429 => {
                    state.consecutive_429 = state.consecutive_429.saturating_add(1);
                }
                Outcome::Challenge => {
                    state.consecutive_challenges = state.consecutive_challenges.saturating_add(1);
                }
                // No streak of their own; both still count toward the
                // window error rate.
                Outcome::BreakerTrip | Outcome::NetworkError => {}
            }

            self.compute(&state)
        };

        if snapshot.consecutive_challenges > self.config.challenge_ceiling {
            self.stop.trip(StopReason::ChallengeStorm);
        } else if snapshot.window_len >= self.config.min_window_samples
            && snapshot.window_error_rate > self.config.error_rate_ceiling
        {
            self.stop.trip(StopReason::ErrorRate);
        } else if snapshot.tier == RiskTier::Stopped {
            self.stop.trip(StopReason::RiskScore);
        }

        if snapshot.tier > RiskTier::Normal {
            log::warn!(
                "risk score {:.2} -> {:?} (403 streak {}, 429 streak {}, err rate {:.2})",
                snapshot.score,
                snapshot.tier,
                snapshot.consecutive_403,
                snapshot.consecutive_429,
                snapshot.window_error_rate
            );
        }

        snapshot
    }

    /// Side-effect-free view of the current state.
    pub fn snapshot(&self) -> RiskSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> RiskSnapshot {
        let window = Duration::from_secs_f64(self.config.window_secs);
        let mut state = self.state.lock().expect("risk lock poisoned");
        state.prune(now, window);
        self.compute(&state)
    }

    fn compute(&self, state: &RiskState) -> RiskSnapshot {
        let weights = &self.config.weights;
        let streak_sat = self.config.streak_saturation.max(1) as f64;
        let challenge_sat = self.config.challenge_saturation.max(1) as f64;

        let window_challenges = state
            .window
            .iter()
            .filter(|(_, outcome)| *outcome == Outcome::Challenge)
            .count() as u32;
        let errors = state
            .window
            .iter()
            .filter(|(_, outcome)| outcome.is_error())
            .count();
        let window_error_rate = if state.window.is_empty() {
            0.0
        } else {
            errors as f64 / state.window.len() as f64
        };

        let score = (weights.consecutive_403 * (state.consecutive_403 as f64 / streak_sat).min(1.0)
            + weights.consecutive_429 * (state.consecutive_429 as f64 / streak_sat).min(1.0)
            + weights.challenge_frequency * (window_challenges as f64 / challenge_sat).min(1.0)
            + weights.error_rate * window_error_rate)
            .clamp(0.0, 1.0);

        RiskSnapshot {
            score,
            tier: self.tier_for(score),
            consecutive_403: state.consecutive_403,
            consecutive_429: state.consecutive_429,
            consecutive_challenges: state.consecutive_challenges,
            window_challenges,
            window_error_rate,
            window_len: state.window.len(),
        }
    }

    /// Monotone score-to-tier mapping; no hysteresis band.
    fn tier_for(&self, score: f64) -> RiskTier {
        if score >= self.config.emergency_threshold {
            RiskTier::Stopped
        } else if score >= self.config.critical_threshold {
            RiskTier::Paused
        } else if score >= self.config.warning_threshold {
            RiskTier::Cautious
        } else {
            RiskTier::Normal
        }
    }

    /// Factor applied to jitter/backoff bases at the given tier.
    pub fn delay_multiplier(&self, tier: RiskTier) -> f64 {
        match tier {
            RiskTier::Normal => 1.0,
            RiskTier::Cautious => self.config.cautious_multiplier,
            // Paused and Stopped pause instead of scaling; the multiplier is
            // only consulted when requests still flow.
            RiskTier::Paused | RiskTier::Stopped => self.config.cautious_multiplier,
        }
    }

    /// Hold to apply before each request at the given tier, if any.
    pub fn pause_hold(&self, tier: RiskTier) -> Option<Duration> {
        match tier {
            RiskTier::Paused => Some(Duration::from_secs_f64(self.config.pause_hold_secs)),
            _ => None,
        }
    }
}
