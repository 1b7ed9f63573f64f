//! # stealthflow
//!
//! Request orchestration core for scraping workloads that need to stay
//! under anti-bot rate and detection ceilings.
//!
//! Every outbound request flows through one pipeline: a weighted browser
//! profile catalog, per-tier token-bucket pacing with human-like jitter,
//! per-target circuit breakers, a multi-tier fallback chain, bounded
//! sessions with a gradual header-introduction schedule, and a sliding
//! window risk monitor wired to a latching emergency stop.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stealthflow::{
//!     LogicalRequest, Orchestrator, OrchestratorConfig, ReqwestTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(ReqwestTransport::new()?);
//!     let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!         .with_transport("curl-impersonate", transport.clone())
//!         .with_transport("tls-mimic", transport.clone())
//!         .with_transport("browser", transport)
//!         .build()?;
//!
//!     let url = url::Url::parse("https://api.example.com/items")?;
//!     let response = orchestrator
//!         .submit(LogicalRequest::get("items-1", url))
//!         .await?;
//!     println!("{} ({} bytes)", response.status, response.body.len());
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod config;
pub mod modules;

pub use crate::orchestrator::{
    Orchestrator,
    OrchestratorBuilder,
    OrchestratorError,
    OrchestratorResult,
};

pub use crate::config::{ConfigurationError, OrchestratorConfig, TierConfig};

pub use crate::modules::{
    AllTiersExhaustedError,
    BreakerConfig,
    BreakerOpenError,
    BreakerPhase,
    CircuitBreaker,
    ClientTier,
    EmergencyStop,
    EventDispatcher,
    EventHandler,
    FallbackChain,
    GlobalStats,
    HeaderStage,
    JitterConfig,
    LoggingHandler,
    LogicalRequest,
    OrchestratorEvent,
    Outcome,
    Profile,
    ProfileCatalog,
    ReqwestTransport,
    RiskConfig,
    RiskMonitor,
    RiskSnapshot,
    RiskTier,
    RiskWeights,
    Session,
    SessionConfig,
    SessionManager,
    StatsSnapshot,
    StopReason,
    TierFailure,
    TierResponse,
    TierStats,
    TierStatsCollector,
    TokenBucketLimiter,
    Transport,
    TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
