//! Emergency-stop kill switch.
//!
//! A process-wide latch that blocks all new logical requests once a
//! suspected-detection condition fires. Recovery is only ever explicit:
//! time passing does not clear the latch.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Why the latch tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Consecutive challenge responses exceeded the configured ceiling.
    ChallengeStorm,
    /// Error rate within the risk window exceeded the configured ceiling.
    ErrorRate,
    /// Aggregated risk score crossed the emergency threshold.
    RiskScore,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ChallengeStorm => write!(f, "consecutive challenge ceiling exceeded"),
            StopReason::ErrorRate => write!(f, "error rate ceiling exceeded"),
            StopReason::RiskScore => write!(f, "risk score reached emergency threshold"),
        }
    }
}

/// Boolean latch shared by every component of one orchestrator.
#[derive(Debug, Default)]
pub struct EmergencyStop {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the stop. The first reason wins; later trips are ignored so the
    /// operator sees what originally fired.
    pub fn trip(&self, reason: StopReason) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            log::error!("EMERGENCY STOP: {reason}");
            *self.reason.lock().expect("stop lock poisoned") = Some(reason);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().expect("stop lock poisoned")
    }

    /// Explicit operator reset. This is the only path out of the stopped
    /// state.
    pub fn reset(&self) {
        *self.reason.lock().expect("stop lock poisoned") = None;
        self.stopped.store(false, Ordering::SeqCst);
        log::info!("emergency stop cleared by explicit reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins_and_reset_clears() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_stopped());

        stop.trip(StopReason::ChallengeStorm);
        stop.trip(StopReason::ErrorRate);
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some(StopReason::ChallengeStorm));

        stop.reset();
        assert!(!stop.is_stopped());
        assert_eq!(stop.reason(), None);
    }
}
