//! High level request orchestration.
//!
//! Wires together the session manager, fallback chain, risk monitor, and
//! emergency stop to expose the single entry point external callers use.
//! All state is in-memory and owned by the orchestrator instance, so
//! independent orchestrators (one per test, say) coexist freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{ConfigurationError, OrchestratorConfig};
use crate::modules::breaker::CircuitBreaker;
use crate::modules::events::{
    EmergencyTrippedEvent, EventDispatcher, EventHandler, LoggingHandler, OrchestratorEvent,
    RequestCompletedEvent, RequestStartedEvent, RiskTierChangedEvent, SessionRotatedEvent,
    StatsHandler,
};
use crate::modules::fallback::{
    AllTiersExhaustedError, ClientTier, FallbackChain, LogicalRequest, TierResponse, Transport,
};
use crate::modules::profiles::ProfileCatalog;
use crate::modules::risk::{RiskMonitor, RiskSnapshot, RiskTier};
use crate::modules::session::SessionManager;
use crate::modules::stats::{StatsSnapshot, TierStatsCollector};
use crate::modules::stop::{EmergencyStop, StopReason};

/// Result alias used across the orchestration layer.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Error surfaced to the calling job.
///
/// Everything else (breaker refusals, individual transport failures, rate
/// limit waits) is absorbed and handled inside the chain.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The kill switch is latched; no request was attempted. Reported
    /// distinctly so operators can tell "suspected detection" apart from
    /// ordinary network failure.
    #[error("emergency stop active: {0}")]
    EmergencyStopped(StopReason),
    #[error(transparent)]
    Exhausted(#[from] AllTiersExhaustedError),
}

/// Fluent builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transports: HashMap<String, Arc<dyn Transport>>,
    extra_handlers: Vec<Arc<dyn EventHandler>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            transports: HashMap::new(),
            extra_handlers: Vec::new(),
        }
    }

    /// Bind a transport implementation to a configured tier name.
    pub fn with_transport(mut self, tier: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(tier.into(), transport);
        self
    }

    /// Register an additional event handler next to the built-in logging and
    /// stats handlers.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn build(mut self) -> Result<Orchestrator, ConfigurationError> {
        self.config.validate()?;

        let catalog = ProfileCatalog::new(self.config.profiles.clone())?;
        let sessions = SessionManager::new(self.config.session.clone(), catalog)?;

        let mut tiers = Vec::with_capacity(self.config.tiers.len());
        for tier_config in &self.config.tiers {
            let transport = self.transports.remove(&tier_config.name).ok_or_else(|| {
                ConfigurationError::MissingTransport {
                    tier: tier_config.name.clone(),
                }
            })?;
            tiers.push(ClientTier {
                config: tier_config.clone(),
                transport,
            });
        }

        let stop = Arc::new(EmergencyStop::new());
        let risk = Arc::new(RiskMonitor::new(self.config.risk, stop.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.breaker,
            self.config
                .tiers
                .iter()
                .map(|tier| tier.breaker_key().to_string()),
        ));

        let stats = TierStatsCollector::new();
        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        events.register_handler(Arc::new(StatsHandler::new(stats.clone())));
        for handler in self.extra_handlers {
            events.register_handler(handler);
        }
        let events = Arc::new(events);

        let chain = FallbackChain::new(
            tiers,
            breaker,
            risk.clone(),
            events.clone(),
            self.config.jitter,
            self.config.backoff_base_secs,
        );

        Ok(Orchestrator {
            sessions,
            chain,
            risk,
            stop,
            events,
            stats,
            last_session_id: AtomicU64::new(0),
            last_risk_tier: Mutex::new(RiskTier::Normal),
            stop_announced: AtomicBool::new(false),
        })
    }
}

/// Top-level façade; the only component external callers invoke.
#[derive(Debug)]
pub struct Orchestrator {
    sessions: SessionManager,
    chain: FallbackChain,
    risk: Arc<RiskMonitor>,
    stop: Arc<EmergencyStop>,
    events: Arc<EventDispatcher>,
    stats: TierStatsCollector,
    last_session_id: AtomicU64,
    last_risk_tier: Mutex<RiskTier>,
    stop_announced: AtomicBool,
}

impl Orchestrator {
    /// Start building an orchestrator from the given configuration.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Issue one logical request through the orchestration core.
    pub async fn submit(&self, request: LogicalRequest) -> OrchestratorResult<TierResponse> {
        if let Some(reason) = self.stopped_reason() {
            return Err(OrchestratorError::EmergencyStopped(reason));
        }

        let now = Instant::now();
        let session = self.sessions.checkout();
        let previous = self.last_session_id.swap(session.id, Ordering::SeqCst);
        if previous != 0 && previous != session.id {
            self.events
                .dispatch(OrchestratorEvent::SessionRotated(SessionRotatedEvent {
                    old_session_id: previous,
                    new_session_id: session.id,
                    profile_id: session.profile.id.clone(),
                    timestamp: Utc::now(),
                }));
        }
        session.mark_request();
        let headers = self.sessions.headers_for(&session, now);

        let snapshot = self.risk.snapshot();
        {
            let mut last = self.last_risk_tier.lock().expect("risk tier lock poisoned");
            if *last != snapshot.tier {
                *last = snapshot.tier;
                self.events
                    .dispatch(OrchestratorEvent::RiskTierChanged(RiskTierChangedEvent {
                        score: snapshot.score,
                        tier: snapshot.tier,
                        timestamp: Utc::now(),
                    }));
            }
        }
        if let Some(hold) = self.risk.pause_hold(snapshot.tier) {
            log::warn!(
                "risk tier Paused (score {:.2}); holding {:.0}s before request '{}'",
                snapshot.score,
                hold.as_secs_f64(),
                request.id
            );
            sleep(hold).await;
        }
        let multiplier = self.risk.delay_multiplier(snapshot.tier);

        self.events
            .dispatch(OrchestratorEvent::RequestStarted(RequestStartedEvent {
                request_id: request.id.clone(),
                method: request.method.clone(),
                url: request.url.clone(),
                session_id: session.id,
                profile_id: session.profile.id.clone(),
                timestamp: Utc::now(),
            }));

        let result = self
            .chain
            .execute(&session.profile, &headers, &request, multiplier)
            .await;

        // The chain may have latched the kill switch while this request was
        // in flight; announce it once per trip.
        if let Some(reason) = self.stopped_reason()
            && self
                .stop_announced
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.events
                .dispatch(OrchestratorEvent::EmergencyTripped(EmergencyTrippedEvent {
                    reason,
                    timestamp: Utc::now(),
                }));
        }

        match result {
            Ok((tier, response)) => {
                self.events
                    .dispatch(OrchestratorEvent::RequestCompleted(RequestCompletedEvent {
                        request_id: request.id.clone(),
                        tier: Some(tier),
                        success: true,
                        timestamp: Utc::now(),
                    }));
                Ok(response)
            }
            Err(exhausted) => {
                self.events
                    .dispatch(OrchestratorEvent::RequestCompleted(RequestCompletedEvent {
                        request_id: request.id.clone(),
                        tier: None,
                        success: false,
                        timestamp: Utc::now(),
                    }));
                Err(exhausted.into())
            }
        }
    }

    /// Per-tier and global counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current risk view, pruned to the sliding window.
    pub fn risk_snapshot(&self) -> RiskSnapshot {
        self.risk.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Explicit operator reset of the emergency stop; the only recovery
    /// path once the latch has tripped.
    pub fn reset_emergency_stop(&self) {
        self.stop.reset();
        self.stop_announced.store(false, Ordering::SeqCst);
    }

    fn stopped_reason(&self) -> Option<StopReason> {
        if self.stop.is_stopped() {
            // RiskScore covers the rare race where the reason is not yet
            // recorded.
            Some(self.stop.reason().unwrap_or(StopReason::RiskScore))
        } else {
            None
        }
    }
}
