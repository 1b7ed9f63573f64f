//! Per-tier statistics collection.
//!
//! Aggregates attempt counts and latency percentiles per client tier for
//! observability; fed by the event dispatcher.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregated counters across all tiers.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_attempts: 0,
            successes: 0,
            failures: 0,
            skipped: 0,
        }
    }
}

/// Tier-scoped stats snapshot.
#[derive(Debug, Clone)]
pub struct TierStats {
    pub tier: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Attempts refused without a transport call (breaker open or limiter
    /// wait ceiling exceeded).
    pub skipped: u64,
    pub last_status: Option<u16>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub global: GlobalStats,
    pub tiers: Vec<TierStats>,
}

#[derive(Debug)]
struct TierAccumulator {
    attempts: u64,
    successes: u64,
    failures: u64,
    skipped: u64,
    last_status: Option<u16>,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl TierAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            skipped: 0,
            last_status: None,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record(&mut self, success: bool, status: Option<u16>, latency: Duration) {
        self.attempts += 1;
        if let Some(status) = status {
            self.last_status = Some(status);
        }
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }

    fn snapshot(&self, tier: &str) -> TierStats {
        let (avg, p95) = self.latency_stats();
        TierStats {
            tier: tier.to_string(),
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            skipped: self.skipped,
            last_status: self.last_status,
            average_latency: avg,
            p95_latency: p95,
        }
    }
}

#[derive(Debug)]
struct StatsState {
    global: GlobalStats,
    max_window: usize,
    tiers: HashMap<String, TierAccumulator>,
}

impl StatsState {
    fn accumulator_mut(&mut self, tier: &str) -> &mut TierAccumulator {
        self.tiers
            .entry(tier.to_string())
            .or_insert_with(|| TierAccumulator::new(self.max_window))
    }
}

/// Thread-safe per-tier stats collector.
#[derive(Clone, Debug)]
pub struct TierStatsCollector {
    inner: Arc<Mutex<StatsState>>,
}

impl TierStatsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsState {
                global: GlobalStats::default(),
                max_window: window.max(16),
                tiers: HashMap::new(),
            })),
        }
    }

    pub fn record_attempt(
        &self,
        tier: &str,
        success: bool,
        status: Option<u16>,
        latency: Duration,
    ) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.global.total_attempts += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }
        guard.accumulator_mut(tier).record(success, status, latency);
    }

    pub fn record_skip(&self, tier: &str) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.global.skipped += 1;
        guard.accumulator_mut(tier).skipped += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let guard = self.inner.lock().expect("stats lock poisoned");
        let tiers = guard
            .tiers
            .iter()
            .map(|(tier, acc)| acc.snapshot(tier))
            .collect();
        StatsSnapshot {
            global: guard.global.clone(),
            tiers,
        }
    }
}

impl Default for TierStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
