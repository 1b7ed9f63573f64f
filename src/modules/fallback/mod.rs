//! Multi-tier fallback chain execution.
//!
//! Issues one logical request by trying client implementations in priority
//! order, consulting each tier's limiter and breaker before every attempt
//! and reporting every outcome into the risk monitor before any retry
//! decision is made.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::config::TierConfig;
use crate::modules::breaker::CircuitBreaker;
use crate::modules::events::{
    EventDispatcher, OrchestratorEvent, TierAttemptEvent, TierSkippedEvent,
};
use crate::modules::limiter::{JitterConfig, TokenBucketLimiter};
use crate::modules::profiles::Profile;
use crate::modules::risk::{Outcome, RiskMonitor};

/// One request as submitted by the calling job.
#[derive(Debug, Clone)]
pub struct LogicalRequest {
    /// Caller-supplied correlation id, used in logs and events only.
    pub id: String,
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
}

impl LogicalRequest {
    pub fn get(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            method: Method::GET,
            url,
            body: None,
        }
    }
}

/// Read-only response returned by a tier transport.
#[derive(Debug, Clone)]
pub struct TierResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TierResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Transport-level failure raised by a tier implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("challenge detected: {0}")]
    Challenge(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Classification fed into the risk monitor.
    pub fn outcome(&self) -> Outcome {
        match self {
            TransportError::Status(403) => Outcome::Http403,
            TransportError::Status(429) => Outcome::Http429,
            TransportError::Challenge(_) => Outcome::Challenge,
            _ => Outcome::NetworkError,
        }
    }
}

/// Uniform request contract every tier implementation exposes.
///
/// The core treats all transports identically; how a transport achieves its
/// fingerprint is its own business.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        profile: &Profile,
        headers: &HeaderMap,
        request: &LogicalRequest,
    ) -> Result<TierResponse, TransportError>;
}

/// A configured tier bound to its transport.
pub struct ClientTier {
    pub config: TierConfig,
    pub transport: Arc<dyn Transport>,
}

/// Terminal error when every tier has been exhausted, carrying the last
/// error seen per tier for diagnostics.
#[derive(Debug, Clone, Error)]
#[error("all client tiers exhausted: {}", summarize(.failures))]
pub struct AllTiersExhaustedError {
    pub failures: Vec<TierFailure>,
}

#[derive(Debug, Clone)]
pub struct TierFailure {
    pub tier: String,
    pub error: String,
}

fn summarize(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.tier, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Next action for one logical request, as decided by [`ChainCursor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChainStep {
    /// Back off for the given delay, then retry the same tier.
    Backoff { tier: usize, delay: Duration },
    /// Move on to the given tier, first attempt.
    NextTier { tier: usize },
    /// Nothing left to try.
    Exhausted,
}

/// Pure per-request retry state machine: tier index and attempt index.
///
/// Kept free of clocks and sleeping so tests can drive it step by step; the
/// executor owns the actual suspension.
#[derive(Debug, Clone, Copy)]
pub struct ChainCursor {
    tier: usize,
    attempt: u32,
    backoff_base: f64,
}

impl ChainCursor {
    pub fn new(backoff_base: f64) -> Self {
        Self {
            tier: 0,
            attempt: 0,
            backoff_base,
        }
    }

    pub fn position(&self) -> (usize, u32) {
        (self.tier, self.attempt)
    }

    /// Register a failed attempt and decide what happens next.
    pub fn step_failure(&mut self, max_attempts: u32, tier_count: usize) -> ChainStep {
        self.attempt += 1;
        if self.attempt < max_attempts {
            return ChainStep::Backoff {
                tier: self.tier,
                delay: self.backoff_delay(),
            };
        }
        self.advance_tier(tier_count)
    }

    /// Abandon the current tier outright (breaker open, wait budget blown).
    pub fn skip_tier(&mut self, tier_count: usize) -> ChainStep {
        self.advance_tier(tier_count)
    }

    fn advance_tier(&mut self, tier_count: usize) -> ChainStep {
        self.tier += 1;
        self.attempt = 0;
        if self.tier < tier_count {
            ChainStep::NextTier { tier: self.tier }
        } else {
            ChainStep::Exhausted
        }
    }

    /// `base^attempt` seconds, where the first failure yields `base` itself.
    fn backoff_delay(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base.powi(self.attempt as i32))
    }
}

/// Walks the tier sequence for each logical request.
pub struct FallbackChain {
    tiers: Vec<ClientTier>,
    limiter: TokenBucketLimiter,
    breaker: Arc<CircuitBreaker>,
    risk: Arc<RiskMonitor>,
    events: Arc<EventDispatcher>,
    jitter: JitterConfig,
    backoff_base: f64,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain").finish_non_exhaustive()
    }
}

impl FallbackChain {
    pub fn new(
        tiers: Vec<ClientTier>,
        breaker: Arc<CircuitBreaker>,
        risk: Arc<RiskMonitor>,
        events: Arc<EventDispatcher>,
        jitter: JitterConfig,
        backoff_base: f64,
    ) -> Self {
        let limiter = TokenBucketLimiter::new(
            tiers
                .iter()
                .map(|tier| (tier.config.name.clone(), tier.config.rate_per_sec, tier.config.burst)),
        );
        Self {
            tiers,
            limiter,
            breaker,
            risk,
            events,
            jitter,
            backoff_base,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Issue one logical request through the chain.
    ///
    /// `delay_multiplier` scales the human-jitter term per the current risk
    /// tier. Within one call, tiers are strictly sequential; a success from
    /// any tier short-circuits the rest.
    pub async fn execute(
        &self,
        profile: &Profile,
        headers: &HeaderMap,
        request: &LogicalRequest,
        delay_multiplier: f64,
    ) -> Result<(String, TierResponse), AllTiersExhaustedError> {
        let mut cursor = ChainCursor::new(self.backoff_base);
        let mut failures: Vec<TierFailure> = Vec::with_capacity(self.tiers.len());
        // Cumulative limiter wait for the tier currently being attempted.
        // The budget spans every attempt against the tier, so retries keep
        // drawing down the same allowance.
        let mut waited_tier = 0usize;
        let mut waited = Duration::ZERO;

        'tiers: loop {
            let (tier_index, _) = cursor.position();
            let Some(tier) = self.tiers.get(tier_index) else {
                break;
            };
            let name = tier.config.name.clone();
            if waited_tier != tier_index {
                waited_tier = tier_index;
                waited = Duration::ZERO;
            }

            // Limiter first: the wait budget covers the whole tier, so a
            // saturated bucket abandons the tier instead of stalling the
            // chain indefinitely.
            let wait_budget = Duration::from_secs_f64(tier.config.max_limiter_wait_secs);
            loop {
                let wait = self.limiter.acquire(&name);
                if wait.is_zero() {
                    break;
                }
                waited += wait;
                if waited > wait_budget {
                    self.skip(request, &name, "rate limit wait budget exceeded", &mut failures);
                    match cursor.skip_tier(self.tiers.len()) {
                        ChainStep::Exhausted => break 'tiers,
                        _ => continue 'tiers,
                    }
                }
                sleep(wait).await;
            }

            // Human-like spacing on top of the raw token wait.
            let jitter = self.jitter.sample(delay_multiplier);
            if !jitter.is_zero() {
                sleep(jitter).await;
            }

            // Breaker per attempt so a half-open target admits exactly one
            // trial even under worker contention.
            let pass = match self.breaker.try_acquire(tier.config.breaker_key()) {
                Ok(pass) => pass,
                Err(err) => {
                    // A refused pass is itself a risk signal.
                    self.risk.observe(Outcome::BreakerTrip);
                    self.skip(request, &name, &err.to_string(), &mut failures);
                    match cursor.skip_tier(self.tiers.len()) {
                        ChainStep::Exhausted => break 'tiers,
                        _ => continue 'tiers,
                    }
                }
            };

            let attempt_no = cursor.position().1 + 1;
            let started = Instant::now();
            let attempt_timeout = Duration::from_secs_f64(tier.config.timeout_secs);
            let result = match timeout(
                attempt_timeout,
                tier.transport.send(profile, headers, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(attempt_timeout)),
            };
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    pass.succeed();
                    self.risk.observe(Outcome::Success);
                    self.events
                        .dispatch(OrchestratorEvent::TierAttempt(TierAttemptEvent {
                            request_id: request.id.clone(),
                            tier: name.clone(),
                            attempt: attempt_no,
                            status: Some(response.status),
                            success: true,
                            latency,
                            timestamp: Utc::now(),
                        }));
                    return Ok((name, response));
                }
                Err(err) => {
                    // Observability before the retry decision, always.
                    pass.fail();
                    self.risk.observe(err.outcome());
                    self.events
                        .dispatch(OrchestratorEvent::TierAttempt(TierAttemptEvent {
                            request_id: request.id.clone(),
                            tier: name.clone(),
                            attempt: attempt_no,
                            status: match err {
                                TransportError::Status(code) => Some(code),
                                _ => None,
                            },
                            success: false,
                            latency,
                            timestamp: Utc::now(),
                        }));

                    upsert_failure(&mut failures, &name, err.to_string());

                    match cursor.step_failure(tier.config.max_attempts, self.tiers.len()) {
                        ChainStep::Backoff { delay, .. } => {
                            let scaled = delay.mul_f64(delay_multiplier.max(1.0));
                            log::debug!(
                                "[{}] tier '{name}' attempt {attempt_no} failed; backing off {:.1}s",
                                request.id,
                                scaled.as_secs_f64()
                            );
                            sleep(scaled).await;
                        }
                        ChainStep::NextTier { .. } => {}
                        ChainStep::Exhausted => break,
                    }
                }
            }
        }

        Err(AllTiersExhaustedError { failures })
    }

    fn skip(
        &self,
        request: &LogicalRequest,
        tier: &str,
        reason: &str,
        failures: &mut Vec<TierFailure>,
    ) {
        upsert_failure(failures, tier, reason.to_string());
        self.events
            .dispatch(OrchestratorEvent::TierSkipped(TierSkippedEvent {
                request_id: request.id.clone(),
                tier: tier.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            }));
    }
}

/// Keep only the last error per tier.
fn upsert_failure(failures: &mut Vec<TierFailure>, tier: &str, error: String) {
    if let Some(existing) = failures.iter_mut().find(|f| f.tier == tier) {
        existing.error = error;
    } else {
        failures.push(TierFailure {
            tier: tier.to_string(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::breaker::BreakerConfig;
    use crate::modules::risk::RiskConfig;
    use crate::modules::stop::EmergencyStop;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedTransport {
        status: u16,
        fail: bool,
        calls: AtomicU32,
    }

    impl FixedTransport {
        fn ok() -> Self {
            Self {
                status: 200,
                fail: false,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                status,
                fail: true,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            _profile: &Profile,
            _headers: &HeaderMap,
            _request: &LogicalRequest,
        ) -> Result<TierResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError::Status(self.status))
            } else {
                Ok(TierResponse {
                    status: self.status,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"ok"),
                })
            }
        }
    }

    fn profile() -> Profile {
        Profile {
            id: "chrome_win".into(),
            family: "chrome/windows".into(),
            weight: 100.0,
            headers: Vec::new(),
        }
    }

    fn tier(name: &str, attempts: u32, transport: Arc<dyn Transport>) -> ClientTier {
        ClientTier {
            config: TierConfig {
                name: name.into(),
                max_attempts: attempts,
                rate_per_sec: 100.0,
                burst: 100.0,
                timeout_secs: 5.0,
                max_limiter_wait_secs: 1.0,
                breaker_key: None,
            },
            transport,
        }
    }

    fn chain(tiers: Vec<ClientTier>) -> (FallbackChain, Arc<RiskMonitor>) {
        let stop = Arc::new(EmergencyStop::new());
        let risk = Arc::new(RiskMonitor::new(RiskConfig::default(), stop));
        let keys: Vec<String> = tiers
            .iter()
            .map(|t| t.config.breaker_key().to_string())
            .collect();
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), keys));
        let jitter = JitterConfig {
            base_delay_secs: 0.0,
            noise_std_secs: 0.0,
            noise_clamp_secs: 0.0,
        };
        let chain = FallbackChain::new(
            tiers,
            breaker,
            risk.clone(),
            Arc::new(EventDispatcher::new()),
            jitter,
            // Sub-millisecond backoff keeps the retry path fast in tests.
            0.001,
        );
        (chain, risk)
    }

    fn request() -> LogicalRequest {
        LogicalRequest::get("req-1", Url::parse("https://api.example.com/items").unwrap())
    }

    #[tokio::test]
    async fn falls_through_to_second_tier() {
        let primary = Arc::new(FixedTransport::failing(502));
        let secondary = Arc::new(FixedTransport::ok());
        let (chain, _risk) = chain(vec![
            tier("primary", 1, primary.clone()),
            tier("secondary", 2, secondary.clone()),
        ]);

        let (via, response) = chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap();

        assert_eq!(via, "secondary");
        assert_eq!(response.status, 200);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        // Exactly one failure recorded against the first tier's breaker.
        assert_eq!(chain.breaker().consecutive_failures("primary"), Some(1));
    }

    #[tokio::test]
    async fn retries_within_tier_before_falling_through() {
        let primary = Arc::new(FixedTransport::failing(500));
        let secondary = Arc::new(FixedTransport::ok());
        let (chain, _risk) = chain(vec![
            tier("primary", 3, primary.clone()),
            tier("secondary", 1, secondary),
        ]);

        chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap();

        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_per_tier() {
        let (chain, risk) = chain(vec![
            tier("primary", 2, Arc::new(FixedTransport::failing(403))),
            tier("secondary", 1, Arc::new(FixedTransport::failing(429))),
        ]);

        let err = chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 2);
        assert_eq!(err.failures[0].tier, "primary");
        assert!(err.failures[0].error.contains("403"));
        assert!(err.failures[1].error.contains("429"));
        // Every attempt was observed by the risk monitor.
        assert_eq!(risk.snapshot().window_len, 3);
    }

    #[tokio::test]
    async fn open_breaker_skips_tier_without_transport_call() {
        let primary = Arc::new(FixedTransport::failing(500));
        let secondary = Arc::new(FixedTransport::ok());
        let (chain, _risk) = chain(vec![
            tier("primary", 1, primary.clone()),
            tier("secondary", 1, secondary),
        ]);

        // Three chain executions trip the default threshold of 3.
        for _ in 0..3 {
            chain
                .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
                .await
                .unwrap();
        }
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);

        chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap();
        // Breaker is open; the fourth execution never reaches the transport.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_skip_is_observed_as_breaker_trip() {
        let primary = Arc::new(FixedTransport::failing(500));
        let secondary = Arc::new(FixedTransport::ok());
        let (chain, risk) = chain(vec![
            tier("primary", 1, primary.clone()),
            tier("secondary", 1, secondary),
        ]);

        for _ in 0..3 {
            chain
                .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
                .await
                .unwrap();
        }
        // Three failed attempts plus three successes so far.
        assert_eq!(risk.snapshot().window_len, 6);

        chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap();
        // The refused pass reaches the monitor alongside the fallback
        // tier's success.
        let snapshot = risk.snapshot();
        assert_eq!(snapshot.window_len, 8);
        assert_eq!(snapshot.window_error_rate, 0.5);
    }

    #[tokio::test]
    async fn limiter_wait_budget_spans_all_tier_attempts() {
        let primary = Arc::new(FixedTransport::failing(500));
        let secondary = Arc::new(FixedTransport::ok());
        let mut slow = tier("primary", 3, primary.clone());
        slow.config.rate_per_sec = 10.0;
        slow.config.burst = 1.0;
        slow.config.max_limiter_wait_secs = 0.15;
        let (chain, _risk) = chain(vec![slow, tier("secondary", 1, secondary.clone())]);

        chain
            .execute(&profile(), &HeaderMap::new(), &request(), 1.0)
            .await
            .unwrap();

        // The burst token covers the first attempt and the second draws
        // ~0.1s from the 0.15s budget; the third would push the cumulative
        // wait past it, so the tier is abandoned after two transport calls.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cursor_steps_through_backoff_and_tiers() {
        let mut cursor = ChainCursor::new(2.0);
        assert_eq!(cursor.position(), (0, 0));

        match cursor.step_failure(3, 2) {
            ChainStep::Backoff { tier: 0, delay } => assert_eq!(delay, Duration::from_secs(2)),
            step => panic!("unexpected step {step:?}"),
        }
        match cursor.step_failure(3, 2) {
            ChainStep::Backoff { tier: 0, delay } => assert_eq!(delay, Duration::from_secs(4)),
            step => panic!("unexpected step {step:?}"),
        }
        assert_eq!(cursor.step_failure(3, 2), ChainStep::NextTier { tier: 1 });
        assert_eq!(cursor.step_failure(1, 2), ChainStep::Exhausted);
    }
}
