//! Session lifecycle: profile selection, rotation, and the gradual
//! header-introduction schedule.
//!
//! A session is the unit of activity that shares one fingerprint profile.
//! Rotation thresholds are sampled per session so no two sessions live for
//! the same number of requests or the same wall time.

use http::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::ConfigurationError;
use crate::modules::profiles::{Profile, ProfileCatalog};

/// One stage of the header-introduction schedule: the headers become active
/// once the session has been alive for `after_secs`, and stay active until
/// rotation. Stages are strictly additive.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderStage {
    pub after_secs: f64,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Sampled per session: the request count that forces rotation lies in
    /// `min_requests..=max_requests`.
    pub min_requests: u32,
    pub max_requests: u32,
    /// Sampled per session: the lifetime that forces rotation lies in
    /// `min_duration_secs..=max_duration_secs`.
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    /// Hard safety ceiling; rotation is forced here regardless of the
    /// sampled thresholds.
    pub max_session_duration_secs: f64,
    pub header_schedule: Vec<HeaderStage>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_requests: 50,
            max_requests: 150,
            min_duration_secs: 1800.0,
            max_duration_secs: 3600.0,
            max_session_duration_secs: 7200.0,
            header_schedule: vec![
                HeaderStage {
                    after_secs: 0.0,
                    headers: vec![("accept-language".into(), "en-US,en;q=0.9".into())],
                },
                HeaderStage {
                    after_secs: 300.0,
                    headers: vec![("x-client-properties".into(), "stable".into())],
                },
                HeaderStage {
                    after_secs: 900.0,
                    headers: vec![("x-client-locale".into(), "en-US".into())],
                },
                HeaderStage {
                    after_secs: 1800.0,
                    headers: vec![("x-debug-options".into(), "trace-disabled".into())],
                },
            ],
        }
    }
}

/// Bounded-duration unit of activity pinned to one profile.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub profile: Profile,
    started_at: Instant,
    requests: AtomicU32,
    /// Sampled once at creation.
    max_requests: u32,
    /// Sampled once at creation.
    max_duration: Duration,
}

impl Session {
    fn new(id: u64, profile: Profile, config: &SessionConfig, now: Instant) -> Self {
        let mut rng = rand::thread_rng();
        let max_requests = rng.gen_range(config.min_requests..=config.max_requests.max(config.min_requests));
        let max_duration = Duration::from_secs_f64(
            rng.gen_range(config.min_duration_secs..=config.max_duration_secs.max(config.min_duration_secs)),
        );
        Self {
            id,
            profile,
            started_at: now,
            requests: AtomicU32::new(0),
            max_requests,
            max_duration,
        }
    }

    /// Count one request against this session. The counter only grows;
    /// rotation replaces the whole session rather than resetting it.
    pub fn mark_request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    fn is_expired(&self, now: Instant, hard_ceiling: Duration) -> bool {
        let elapsed = self.elapsed(now);
        elapsed >= hard_ceiling
            || elapsed >= self.max_duration
            || self.request_count() >= self.max_requests
    }
}

/// Owns the active [`Session`] and rotates it when its thresholds expire.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    catalog: ProfileCatalog,
    current: RwLock<Arc<Session>>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig, catalog: ProfileCatalog) -> Result<Self, ConfigurationError> {
        if config.min_requests == 0 || config.max_requests < config.min_requests {
            return Err(ConfigurationError::InvalidSessionBounds(
                "request bounds must satisfy 0 < min <= max".into(),
            ));
        }
        if config.min_duration_secs <= 0.0 || config.max_duration_secs < config.min_duration_secs {
            return Err(ConfigurationError::InvalidSessionBounds(
                "duration bounds must satisfy 0 < min <= max".into(),
            ));
        }
        if config.max_session_duration_secs <= 0.0 {
            return Err(ConfigurationError::InvalidSessionBounds(
                "hard session ceiling must be positive".into(),
            ));
        }

        let profile = catalog.sample().clone();
        let first = Arc::new(Session::new(1, profile, &config, Instant::now()));
        Ok(Self {
            config,
            catalog,
            current: RwLock::new(first),
            generation: AtomicU64::new(1),
        })
    }

    /// Return the active session, rotating first if any threshold expired.
    ///
    /// Rotation is single-writer elected: every worker may detect expiry, but
    /// the generation re-check under the write lock guarantees exactly one
    /// replacement session is created.
    pub fn checkout(&self) -> Arc<Session> {
        self.checkout_at(Instant::now())
    }

    pub(crate) fn checkout_at(&self, now: Instant) -> Arc<Session> {
        let hard_ceiling = Duration::from_secs_f64(self.config.max_session_duration_secs);
        let (seen_id, expired) = {
            let guard = self.current.read().expect("session lock poisoned");
            (guard.id, guard.is_expired(now, hard_ceiling))
        };
        if !expired {
            return self.current.read().expect("session lock poisoned").clone();
        }

        let mut guard = self.current.write().expect("session lock poisoned");
        if guard.id == seen_id {
            let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let profile = self.catalog.sample().clone();
            log::info!(
                "rotating session #{} -> #{id} (profile '{}', {} requests, {:.0}s old)",
                guard.id,
                profile.id,
                guard.request_count(),
                guard.elapsed(now).as_secs_f64()
            );
            *guard = Arc::new(Session::new(id, profile, &self.config, now));
        }
        guard.clone()
    }

    /// Headers active for the session at `now`: the profile's fingerprint
    /// payload plus every schedule stage whose checkpoint has passed.
    pub fn headers_for(&self, session: &Session, now: Instant) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &session.profile.headers {
            insert_header(&mut headers, name, value);
        }

        let elapsed = session.elapsed(now).as_secs_f64();
        for stage in &self.config.header_schedule {
            if elapsed >= stage.after_secs {
                for (name, value) in &stage.headers {
                    insert_header(&mut headers, name, value);
                }
            }
        }
        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => {
            // Malformed pairs come from configuration; drop them loudly
            // rather than failing every request.
            log::warn!("skipping malformed header '{name}'");
        }
    }
}
