//! Orchestrator configuration.
//!
//! Everything tunable lives in one immutable [`OrchestratorConfig`] value
//! loaded at startup and injected into each component at construction; no
//! component reads ambient global state. Validation happens once and fails
//! fast with [`ConfigurationError`].

use serde::Deserialize;
use thiserror::Error;

use crate::modules::breaker::BreakerConfig;
use crate::modules::limiter::JitterConfig;
use crate::modules::profiles::Profile;
use crate::modules::risk::RiskConfig;
use crate::modules::session::SessionConfig;

/// Fatal startup error.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("profile catalog is empty")]
    EmptyProfileCatalog,
    #[error("profile weights sum to {total}, expected 100")]
    ProfileWeightSum { total: f64 },
    #[error("profile '{profile}' has a negative weight")]
    NegativeProfileWeight { profile: String },
    #[error("no client tiers configured")]
    NoTiers,
    #[error("tier '{tier}' is invalid: {reason}")]
    InvalidTier { tier: String, reason: String },
    #[error("duplicate tier name '{tier}'")]
    DuplicateTier { tier: String },
    #[error("no transport registered for tier '{tier}'")]
    MissingTransport { tier: String },
    #[error("invalid session bounds: {0}")]
    InvalidSessionBounds(String),
    #[error("risk thresholds must be ordered: warning < critical < emergency")]
    UnorderedRiskThresholds,
    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Ordered descriptor for one client implementation in the fallback chain.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    /// Tier name; also the limiter bucket key.
    pub name: String,
    /// Attempts against this tier before falling through to the next.
    pub max_attempts: u32,
    /// Token refill rate, tokens per second.
    pub rate_per_sec: f64,
    /// Bucket burst capacity.
    pub burst: f64,
    /// Per-attempt timeout in seconds; exceeding it counts as a failure.
    pub timeout_secs: f64,
    /// Total limiter wait budget for this tier before it is abandoned.
    pub max_limiter_wait_secs: f64,
    /// Breaker key; defaults to the tier name so each tier tracks its own
    /// target health.
    #[serde(default)]
    pub breaker_key: Option<String>,
}

impl TierConfig {
    pub fn breaker_key(&self) -> &str {
        self.breaker_key.as_deref().unwrap_or(&self.name)
    }
}

/// Complete configuration surface, loaded once.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub profiles: Vec<Profile>,
    pub tiers: Vec<TierConfig>,
    pub breaker: BreakerConfig,
    pub session: SessionConfig,
    pub risk: RiskConfig,
    pub jitter: JitterConfig,
    /// Base for the inter-attempt exponential backoff: the delay before
    /// attempt `n+1` within a tier is `backoff_base_secs^n` seconds.
    pub backoff_base_secs: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            tiers: default_tiers(),
            breaker: BreakerConfig::default(),
            session: SessionConfig::default(),
            risk: RiskConfig::default(),
            jitter: JitterConfig::default(),
            backoff_base_secs: 2.0,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a JSON configuration document. Missing sections fall back to
    /// the defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.tiers.is_empty() {
            return Err(ConfigurationError::NoTiers);
        }

        let mut seen = std::collections::HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.name.as_str()) {
                return Err(ConfigurationError::DuplicateTier {
                    tier: tier.name.clone(),
                });
            }
            if tier.max_attempts == 0 {
                return Err(ConfigurationError::InvalidTier {
                    tier: tier.name.clone(),
                    reason: "max_attempts must be at least 1".into(),
                });
            }
            if tier.rate_per_sec <= 0.0 || tier.burst < 1.0 {
                return Err(ConfigurationError::InvalidTier {
                    tier: tier.name.clone(),
                    reason: "rate must be positive and burst at least 1".into(),
                });
            }
            if tier.timeout_secs <= 0.0 {
                return Err(ConfigurationError::InvalidTier {
                    tier: tier.name.clone(),
                    reason: "timeout must be positive".into(),
                });
            }
        }

        if !(self.risk.warning_threshold < self.risk.critical_threshold
            && self.risk.critical_threshold < self.risk.emergency_threshold)
        {
            return Err(ConfigurationError::UnorderedRiskThresholds);
        }

        // Profile weights are re-checked by the catalog constructor; doing it
        // here as well keeps file-based configs failing before any wiring.
        if self.profiles.is_empty() {
            return Err(ConfigurationError::EmptyProfileCatalog);
        }
        let total: f64 = self.profiles.iter().map(|p| p.weight).sum();
        if (total - 100.0).abs() > 0.01 {
            return Err(ConfigurationError::ProfileWeightSum { total });
        }

        Ok(())
    }
}

/// Realistic desktop browser market split, matching the payloads a stealth
/// transport stack typically impersonates.
fn default_profiles() -> Vec<Profile> {
    vec![
        Profile {
            id: "chrome_win".into(),
            family: "chrome/windows".into(),
            weight: 55.0,
            headers: vec![
                (
                    "user-agent".into(),
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36".into(),
                ),
                (
                    "sec-ch-ua".into(),
                    "\"Chromium\";v=\"112\", \"Google Chrome\";v=\"112\", \"Not:A-Brand\";v=\"99\"".into(),
                ),
                ("sec-ch-ua-platform".into(), "\"Windows\"".into()),
            ],
        },
        Profile {
            id: "chrome_mac".into(),
            family: "chrome/macos".into(),
            weight: 25.0,
            headers: vec![
                (
                    "user-agent".into(),
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36".into(),
                ),
                (
                    "sec-ch-ua".into(),
                    "\"Chromium\";v=\"112\", \"Google Chrome\";v=\"112\", \"Not:A-Brand\";v=\"99\"".into(),
                ),
                ("sec-ch-ua-platform".into(), "\"macOS\"".into()),
            ],
        },
        Profile {
            id: "firefox_win".into(),
            family: "firefox/windows".into(),
            weight: 15.0,
            headers: vec![(
                "user-agent".into(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:110.0) Gecko/20100101 Firefox/110.0".into(),
            )],
        },
        Profile {
            id: "safari_mac".into(),
            family: "safari/macos".into(),
            weight: 5.0,
            headers: vec![(
                "user-agent".into(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15".into(),
            )],
        },
    ]
}

/// Primary impersonating client, a slower TLS-mimicking fallback, and a
/// last-resort browser tier with a much tighter budget.
fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "curl-impersonate".into(),
            max_attempts: 3,
            rate_per_sec: 2.0,
            burst: 5.0,
            timeout_secs: 30.0,
            max_limiter_wait_secs: 10.0,
            breaker_key: None,
        },
        TierConfig {
            name: "tls-mimic".into(),
            max_attempts: 2,
            rate_per_sec: 1.5,
            burst: 4.0,
            timeout_secs: 30.0,
            max_limiter_wait_secs: 10.0,
            breaker_key: None,
        },
        TierConfig {
            name: "browser".into(),
            max_attempts: 1,
            rate_per_sec: 0.5,
            burst: 2.0,
            timeout_secs: 60.0,
            max_limiter_wait_secs: 20.0,
            breaker_key: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_tiers() {
        let mut config = OrchestratorConfig::default();
        config.tiers.push(config.tiers[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::DuplicateTier { .. })
        ));
    }

    #[test]
    fn rejects_unordered_risk_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.risk.critical_threshold = config.risk.warning_threshold;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::UnorderedRiskThresholds)
        ));
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = OrchestratorConfig::from_json(r#"{"backoff_base_secs": 1.5}"#).unwrap();
        assert_eq!(config.backoff_base_secs, 1.5);
        assert_eq!(config.tiers.len(), 3);
    }
}
