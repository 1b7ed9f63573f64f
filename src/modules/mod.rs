//! Core orchestration building blocks
//!
//! Pacing, health tracking, risk scoring, session lifecycle, and the
//! fallback chain that ties them together around each request.

pub mod breaker;
pub mod events;
pub mod fallback;
pub mod limiter;
pub mod profiles;
pub mod risk;
pub mod session;
pub mod stats;
pub mod stop;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerOpenError, BreakerPhase, CircuitBreaker};
pub use events::{
    EmergencyTrippedEvent, EventDispatcher, EventHandler, LoggingHandler, OrchestratorEvent,
    RequestCompletedEvent, RequestStartedEvent, RiskTierChangedEvent, SessionRotatedEvent,
    StatsHandler, TierAttemptEvent, TierSkippedEvent,
};
pub use fallback::{
    AllTiersExhaustedError, ChainCursor, ChainStep, ClientTier, FallbackChain, LogicalRequest,
    ReqwestTransport, TierFailure, TierResponse, Transport, TransportError,
};
pub use limiter::{JitterConfig, TokenBucketLimiter};
pub use profiles::{Profile, ProfileCatalog};
pub use risk::{Outcome, RiskConfig, RiskMonitor, RiskSnapshot, RiskTier, RiskWeights};
pub use session::{HeaderStage, Session, SessionConfig, SessionManager};
pub use stats::{GlobalStats, StatsSnapshot, TierStats, TierStatsCollector};
pub use stop::{EmergencyStop, StopReason};
