//! Provider Health Tracker
//!
//! Per-provider rolling health record consumed by provider selection and
//! failover. A provider flips unhealthy only after three consecutive
//! failures; any success resets the counter and restores healthy state.
//! Rate-limit rejections never touch this record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use pn_common::ProviderHealthSnapshot;

/// Consecutive failures before a provider is excluded from selection.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug)]
struct ProviderHealth {
    healthy: bool,
    consecutive_failures: u32,
    total_success: u64,
    total_failure: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            total_success: 0,
            total_failure: 0,
            last_success: None,
            last_failure: None,
        }
    }

    fn attempts(&self) -> u64 {
        self.total_success + self.total_failure
    }

    fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            // No observations yet: treat as fully healthy so a fresh
            // provider is eligible for selection.
            1.0
        } else {
            self.total_success as f64 / attempts as f64
        }
    }
}

/// Outcome of recording a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// No healthy/unhealthy flip occurred.
    Unchanged,
    /// The provider just crossed the consecutive-failure threshold.
    BecameUnhealthy,
    /// A success restored a previously unhealthy provider.
    Recovered,
}

/// Tracks one health record per registered provider.
pub struct ProviderHealthTracker {
    records: DashMap<String, ProviderHealth>,
}

impl ProviderHealthTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn register(&self, provider_id: &str) {
        self.records
            .entry(provider_id.to_string())
            .or_insert_with(ProviderHealth::new);
    }

    /// Record a successful send. Resets the failure counter and restores
    /// healthy state.
    pub fn record_success(&self, provider_id: &str) -> HealthTransition {
        let mut record = match self.records.get_mut(provider_id) {
            Some(r) => r,
            None => return HealthTransition::Unchanged,
        };

        let was_unhealthy = !record.healthy;
        record.consecutive_failures = 0;
        record.healthy = true;
        record.total_success += 1;
        record.last_success = Some(Utc::now());

        if was_unhealthy {
            debug!(provider_id = %provider_id, "Provider recovered");
            HealthTransition::Recovered
        } else {
            HealthTransition::Unchanged
        }
    }

    /// Record a failed send. Flips the provider unhealthy at the
    /// consecutive-failure threshold.
    pub fn record_failure(&self, provider_id: &str) -> HealthTransition {
        let mut record = match self.records.get_mut(provider_id) {
            Some(r) => r,
            None => return HealthTransition::Unchanged,
        };

        record.consecutive_failures += 1;
        record.total_failure += 1;
        record.last_failure = Some(Utc::now());

        if record.healthy && record.consecutive_failures >= UNHEALTHY_THRESHOLD {
            record.healthy = false;
            warn!(
                provider_id = %provider_id,
                consecutive_failures = record.consecutive_failures,
                "Provider marked unhealthy"
            );
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::Unchanged
        }
    }

    pub fn is_healthy(&self, provider_id: &str) -> bool {
        self.records
            .get(provider_id)
            .map(|r| r.healthy)
            .unwrap_or(false)
    }

    pub fn success_rate(&self, provider_id: &str) -> f64 {
        self.records
            .get(provider_id)
            .map(|r| r.success_rate())
            .unwrap_or(0.0)
    }

    /// Total recorded send attempts (success + failure).
    pub fn attempts(&self, provider_id: &str) -> u64 {
        self.records
            .get(provider_id)
            .map(|r| r.attempts())
            .unwrap_or(0)
    }

    pub fn consecutive_failures(&self, provider_id: &str) -> u32 {
        self.records
            .get(provider_id)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<ProviderHealthSnapshot> {
        self.records.get(provider_id).map(|r| ProviderHealthSnapshot {
            provider_id: provider_id.to_string(),
            healthy: r.healthy,
            consecutive_failures: r.consecutive_failures,
            total_success: r.total_success,
            total_failure: r.total_failure,
            success_rate: r.success_rate(),
            last_success: r.last_success,
            last_failure: r.last_failure,
        })
    }

    pub fn snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        self.records
            .iter()
            .map(|entry| {
                let r = entry.value();
                ProviderHealthSnapshot {
                    provider_id: entry.key().clone(),
                    healthy: r.healthy,
                    consecutive_failures: r.consecutive_failures,
                    total_success: r.total_success,
                    total_failure: r.total_failure,
                    success_rate: r.success_rate(),
                    last_success: r.last_success,
                    last_failure: r.last_failure,
                }
            })
            .collect()
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
