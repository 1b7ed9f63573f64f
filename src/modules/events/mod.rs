//! Event system for the orchestration core.
//!
//! Provides hooks for metrics, logging, and custom reactions around request
//! activity.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::risk::RiskTier;
use super::stats::TierStatsCollector;
use super::stop::StopReason;

/// Emitted when a logical request enters the chain.
#[derive(Debug, Clone)]
pub struct RequestStartedEvent {
    pub request_id: String,
    pub method: Method,
    pub url: Url,
    pub session_id: u64,
    pub profile_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Emitted per tier attempt, after its outcome is known.
#[derive(Debug, Clone)]
pub struct TierAttemptEvent {
    pub request_id: String,
    pub tier: String,
    pub attempt: u32,
    pub status: Option<u16>,
    pub success: bool,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a tier is skipped without a transport call.
#[derive(Debug, Clone)]
pub struct TierSkippedEvent {
    pub request_id: String,
    pub tier: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RequestCompletedEvent {
    pub request_id: String,
    pub tier: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRotatedEvent {
    pub old_session_id: u64,
    pub new_session_id: u64,
    pub profile_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskTierChangedEvent {
    pub score: f64,
    pub tier: RiskTier,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EmergencyTrippedEvent {
    pub reason: StopReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    RequestStarted(RequestStartedEvent),
    TierAttempt(TierAttemptEvent),
    TierSkipped(TierSkippedEvent),
    RequestCompleted(RequestCompletedEvent),
    SessionRotated(SessionRotatedEvent),
    RiskTierChanged(RiskTierChangedEvent),
    EmergencyTripped(EmergencyTrippedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &OrchestratorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: OrchestratorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::RequestStarted(started) => {
                log::debug!(
                    "-> [{}] {} {} (session #{}, profile '{}')",
                    started.request_id,
                    started.method,
                    started.url,
                    started.session_id,
                    started.profile_id
                );
            }
            OrchestratorEvent::TierAttempt(attempt) => {
                log::debug!(
                    "<- [{}] tier '{}' attempt {} -> {} ({:.2}s)",
                    attempt.request_id,
                    attempt.tier,
                    attempt.attempt,
                    attempt
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "error".into()),
                    attempt.latency.as_secs_f64()
                );
            }
            OrchestratorEvent::TierSkipped(skipped) => {
                log::info!(
                    "[{}] tier '{}' skipped: {}",
                    skipped.request_id,
                    skipped.tier,
                    skipped.reason
                );
            }
            OrchestratorEvent::RequestCompleted(done) => {
                if done.success {
                    log::debug!(
                        "[{}] completed via tier '{}'",
                        done.request_id,
                        done.tier.as_deref().unwrap_or("?")
                    );
                } else {
                    log::warn!("[{}] exhausted every tier", done.request_id);
                }
            }
            OrchestratorEvent::SessionRotated(rotated) => {
                log::info!(
                    "session #{} -> #{} (profile '{}')",
                    rotated.old_session_id,
                    rotated.new_session_id,
                    rotated.profile_id
                );
            }
            OrchestratorEvent::RiskTierChanged(changed) => {
                log::info!("risk tier {:?} (score {:.2})", changed.tier, changed.score);
            }
            OrchestratorEvent::EmergencyTripped(tripped) => {
                log::error!("emergency stop tripped: {}", tripped.reason);
            }
        }
    }
}

/// Feeds tier attempts into the stats collector.
pub struct StatsHandler {
    collector: TierStatsCollector,
}

impl StatsHandler {
    pub fn new(collector: TierStatsCollector) -> Self {
        Self { collector }
    }
}

impl EventHandler for StatsHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::TierAttempt(attempt) => {
                self.collector.record_attempt(
                    &attempt.tier,
                    attempt.success,
                    attempt.status,
                    attempt.latency,
                );
            }
            OrchestratorEvent::TierSkipped(skipped) => {
                self.collector.record_skip(&skipped.tier);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &OrchestratorEvent) {
            let tag = match event {
                OrchestratorEvent::RequestStarted(_) => "started",
                OrchestratorEvent::TierAttempt(_) => "attempt",
                OrchestratorEvent::TierSkipped(_) => "skipped",
                OrchestratorEvent::RequestCompleted(_) => "completed",
                OrchestratorEvent::SessionRotated(_) => "rotated",
                OrchestratorEvent::RiskTierChanged(_) => "risk",
                OrchestratorEvent::EmergencyTripped(_) => "tripped",
            };
            self.seen.lock().unwrap().push(tag.to_string());
        }
    }

    #[test]
    fn dispatches_to_all_handlers() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(recorder.clone());

        dispatcher.dispatch(OrchestratorEvent::RequestCompleted(RequestCompletedEvent {
            request_id: "req-1".into(),
            tier: Some("primary".into()),
            success: true,
            timestamp: Utc::now(),
        }));

        assert_eq!(recorder.seen.lock().unwrap().as_slice(), ["completed"]);
    }
}
