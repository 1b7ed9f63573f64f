//! End-to-end orchestration scenarios against mock transports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use stealthflow::{
    ConfigurationError, EventHandler, JitterConfig, LogicalRequest, Orchestrator,
    OrchestratorConfig, OrchestratorError, OrchestratorEvent, Profile, SessionConfig, StopReason,
    TierConfig, TierResponse, Transport, TransportError,
};

/// Transport whose behavior is swappable mid-test.
struct ScriptedTransport {
    mode: Mutex<Mode>,
    calls: AtomicU32,
}

#[derive(Clone, Copy)]
enum Mode {
    Ok,
    Status(u16),
    Challenge,
}

impl ScriptedTransport {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: AtomicU32::new(0),
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _profile: &Profile,
        _headers: &HeaderMap,
        _request: &LogicalRequest,
    ) -> Result<TierResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock().unwrap() {
            Mode::Ok => Ok(TierResponse {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"{\"ok\":true}"),
            }),
            Mode::Status(code) => Err(TransportError::Status(code)),
            Mode::Challenge => Err(TransportError::Challenge("challenge-platform".into())),
        }
    }
}

/// Records event tags for assertions.
#[derive(Default)]
struct EventRecorder {
    tags: Mutex<Vec<String>>,
}

impl EventRecorder {
    fn tags(&self) -> Vec<String> {
        self.tags.lock().unwrap().clone()
    }
}

impl EventHandler for EventRecorder {
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
        self.tags.lock().unwrap().push(tag.to_string());
    }
}

fn tier(name: &str, max_attempts: u32) -> TierConfig {
    TierConfig {
        name: name.into(),
        max_attempts,
        rate_per_sec: 1000.0,
        burst: 100.0,
        timeout_secs: 5.0,
        max_limiter_wait_secs: 1.0,
        breaker_key: None,
    }
}

/// Configuration tuned for fast tests: no jitter, sub-millisecond backoff.
fn config(tiers: Vec<TierConfig>) -> OrchestratorConfig {
    OrchestratorConfig {
        profiles: vec![Profile {
            id: "chrome_win".into(),
            family: "chrome/windows".into(),
            weight: 100.0,
            headers: vec![("user-agent".into(), "Mozilla/5.0 test".into())],
        }],
        tiers,
        jitter: JitterConfig {
            base_delay_secs: 0.0,
            noise_std_secs: 0.0,
            noise_clamp_secs: 0.0,
        },
        backoff_base_secs: 0.001,
        ..OrchestratorConfig::default()
    }
}

fn request(id: &str) -> LogicalRequest {
    LogicalRequest::get(id, Url::parse("https://api.example.com/items").unwrap())
}

#[tokio::test]
async fn successful_request_flows_through_primary_tier() {
    let primary = ScriptedTransport::new(Mode::Ok);
    let orchestrator = Orchestrator::builder(config(vec![tier("primary", 2)]))
        .with_transport("primary", primary.clone())
        .build()
        .unwrap();

    let response = orchestrator.submit(request("req-1")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "{\"ok\":true}");
    assert_eq!(primary.calls(), 1);

    let stats = orchestrator.stats();
    assert_eq!(stats.global.total_attempts, 1);
    assert_eq!(stats.global.successes, 1);
    let primary_stats = stats.tiers.iter().find(|t| t.tier == "primary").unwrap();
    assert_eq!(primary_stats.successes, 1);
    assert_eq!(primary_stats.last_status, Some(200));
}

#[tokio::test]
async fn falls_back_to_secondary_tier_on_failure() {
    let primary = ScriptedTransport::new(Mode::Status(502));
    let secondary = ScriptedTransport::new(Mode::Ok);
    let recorder = Arc::new(EventRecorder::default());
    let orchestrator = Orchestrator::builder(config(vec![tier("primary", 2), tier("backup", 1)]))
        .with_transport("primary", primary.clone())
        .with_transport("backup", secondary.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let response = orchestrator.submit(request("req-1")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(primary.calls(), 2);
    assert_eq!(secondary.calls(), 1);

    let tags = recorder.tags();
    assert_eq!(tags.iter().filter(|t| *t == "attempt").count(), 3);
    assert_eq!(tags.last().map(String::as_str), Some("completed"));
}

#[tokio::test]
async fn exhaustion_surfaces_per_tier_diagnostics() {
    let orchestrator = Orchestrator::builder(config(vec![tier("primary", 2), tier("backup", 1)]))
        .with_transport("primary", ScriptedTransport::new(Mode::Status(500)))
        .with_transport("backup", ScriptedTransport::new(Mode::Status(502)))
        .build()
        .unwrap();

    let err = orchestrator.submit(request("req-1")).await.unwrap_err();
    let OrchestratorError::Exhausted(exhausted) = err else {
        panic!("expected exhaustion, got {err}");
    };
    assert_eq!(exhausted.failures.len(), 2);
    assert!(exhausted.failures[0].error.contains("500"));
    assert!(exhausted.failures[1].error.contains("502"));
}

#[tokio::test]
async fn challenge_storm_latches_emergency_stop_until_reset() {
    let transport = ScriptedTransport::new(Mode::Challenge);
    let recorder = Arc::new(EventRecorder::default());
    // Five attempts across two tiers cross the consecutive-challenge ceiling
    // of three before either tier's breaker opens mid-submission.
    let orchestrator = Orchestrator::builder(config(vec![tier("primary", 3), tier("backup", 2)]))
        .with_transport("primary", transport.clone())
        .with_transport("backup", transport.clone())
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let err = orchestrator.submit(request("req-1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Exhausted(_)));
    assert!(orchestrator.is_stopped());
    assert!(recorder.tags().iter().any(|t| t == "tripped"));

    // While latched, submissions are refused before any transport call.
    let calls_before = transport.calls();
    let err = orchestrator.submit(request("req-2")).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::EmergencyStopped(StopReason::ChallengeStorm)
    ));
    assert_eq!(transport.calls(), calls_before);

    // Explicit reset is the only way back in.
    orchestrator.reset_emergency_stop();
    assert!(!orchestrator.is_stopped());
    transport.set_mode(Mode::Ok);
    let response = orchestrator.submit(request("req-3")).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn sessions_rotate_after_request_budget() {
    let transport = ScriptedTransport::new(Mode::Ok);
    let recorder = Arc::new(EventRecorder::default());
    let mut cfg = config(vec![tier("primary", 1)]);
    cfg.session = SessionConfig {
        min_requests: 1,
        max_requests: 1,
        ..SessionConfig::default()
    };
    let orchestrator = Orchestrator::builder(cfg)
        .with_transport("primary", transport)
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    for i in 0..3 {
        orchestrator.submit(request(&format!("req-{i}"))).await.unwrap();
    }

    // Each submission after the first finds the one-request budget spent.
    let rotations = recorder.tags().iter().filter(|t| *t == "rotated").count();
    assert_eq!(rotations, 2);
}

#[tokio::test]
async fn builder_rejects_unbound_tier() {
    let err = Orchestrator::builder(config(vec![tier("primary", 1), tier("backup", 1)]))
        .with_transport("primary", ScriptedTransport::new(Mode::Ok))
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigurationError::MissingTransport { ref tier } if tier == "backup"
    ));
}
