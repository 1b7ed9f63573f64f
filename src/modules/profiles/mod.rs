//! Fingerprint profile catalog.
//!
//! Holds the weighted set of browser identities a session can present and
//! performs weighted-random selection across them.

use rand::Rng;
use serde::Deserialize;

use crate::config::ConfigurationError;

/// Tolerance applied when checking that profile weights sum to 100.
const WEIGHT_SUM_EPSILON: f64 = 0.01;

/// Immutable descriptor for one coherent browser identity.
///
/// The header payload is opaque to the core; transports forward it verbatim
/// so the wire-level fingerprint stays consistent with the advertised
/// identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub id: String,
    /// Browser/OS combination, e.g. `chrome/windows`.
    pub family: String,
    /// Relative selection weight in percent. Weights across the catalog must
    /// sum to 100.
    pub weight: f64,
    /// Headers presented by every request issued under this profile.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Weighted catalog of fingerprint profiles.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    profiles: Vec<Profile>,
}

impl ProfileCatalog {
    /// Build a catalog, validating the weight invariant up front.
    pub fn new(profiles: Vec<Profile>) -> Result<Self, ConfigurationError> {
        if profiles.is_empty() {
            return Err(ConfigurationError::EmptyProfileCatalog);
        }

        let total: f64 = profiles.iter().map(|profile| profile.weight).sum();
        if (total - 100.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigurationError::ProfileWeightSum { total });
        }

        if let Some(bad) = profiles.iter().find(|profile| profile.weight < 0.0) {
            return Err(ConfigurationError::NegativeProfileWeight {
                profile: bad.id.clone(),
            });
        }

        Ok(Self { profiles })
    }

    /// Draw one profile, weighted by the configured percentages.
    ///
    /// A profile may repeat across consecutive draws; the catalog makes no
    /// effort to avoid reuse between sessions.
    pub fn sample(&self) -> &Profile {
        let mut rng = rand::thread_rng();
        self.sample_with(&mut rng)
    }

    fn sample_with<R: Rng>(&self, rng: &mut R) -> &Profile {
        let total: f64 = self.profiles.iter().map(|profile| profile.weight).sum();
        let mut target = rng.gen_range(0.0..total);
        for profile in &self.profiles {
            if target < profile.weight {
                return profile;
            }
            target -= profile.weight;
        }
        // Floating point slack can walk past the last bucket.
        self.profiles
            .last()
            .expect("catalog validated non-empty")
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn profile(id: &str, weight: f64) -> Profile {
        Profile {
            id: id.to_string(),
            family: format!("{id}/test"),
            weight,
            headers: Vec::new(),
        }
    }

    #[test]
    fn rejects_empty_catalog() {
        let err = ProfileCatalog::new(Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyProfileCatalog));
    }

    #[test]
    fn rejects_bad_weight_sum() {
        let err = ProfileCatalog::new(vec![profile("a", 50.0), profile("b", 30.0)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::ProfileWeightSum { .. }));
    }

    #[test]
    fn sampling_converges_to_configured_distribution() {
        let catalog = ProfileCatalog::new(vec![
            profile("chrome_win", 55.0),
            profile("chrome_mac", 25.0),
            profile("firefox_win", 15.0),
            profile("safari_mac", 5.0),
        ])
        .unwrap();

        let draws = 20_000usize;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(catalog.sample().id.clone()).or_default() += 1;
        }

        for expected in catalog.profiles() {
            let observed = counts.get(&expected.id).copied().unwrap_or(0) as f64 / draws as f64;
            let target = expected.weight / 100.0;
            assert!(
                (observed - target).abs() < 0.03,
                "{}: observed {observed:.3}, expected {target:.3}",
                expected.id
            );
        }
    }
}
