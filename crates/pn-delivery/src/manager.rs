//! Multi-Provider Delivery Manager
//!
//! One instance per channel family (mail, text messaging). Holds a
//! prioritized provider pool, selects a primary/backup pair from the
//! currently healthy providers, performs rate-limited sends with exactly one
//! failover hop, and records cost, health and webhook-fed delivery stats.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use pn_common::{
    Address, BulkDeliveryReport, BulkOutcome, BulkPayload, ChannelType, CostSnapshot,
    DeliveryEvent, DeliveryRequest, DeliveryResult, EventBus, ProviderHealthSnapshot,
    ProviderStatsSnapshot, PulseEvent, WebhookEvent,
};

use crate::error::{DeliveryError, Result};
use crate::health::{HealthTransition, ProviderHealthTracker};
use crate::provider::{validate_address, Provider, TransportReceipt};
use crate::rate_limit::ProviderRateLimiter;

/// Targets per bulk batch.
const BULK_BATCH_SIZE: usize = 50;
/// Fixed pause between bulk batches, the only deliberate throttle besides
/// the per-provider limiters.
const BULK_BATCH_DELAY: Duration = Duration::from_millis(200);
/// Backup must lead the primary's success rate by more than this to earn a
/// role swap.
const SWITCH_MARGIN: f64 = 0.10;
/// Minimum recorded attempts on both providers before a role swap is
/// considered, so scarce data cannot cause oscillation.
pub const MIN_SWITCH_SAMPLES: u64 = 20;
/// Webhook tracking records older than this are purged.
const TRACKING_RETENTION_HOURS: i64 = 24;
const TRACKING_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

struct RegisteredProvider {
    provider: Provider,
    limiter: ProviderRateLimiter,
}

#[derive(Debug, Clone)]
struct TrackingRecord {
    provider_id: String,
    event: DeliveryEvent,
    recipient: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    queued: u64,
    sent: u64,
    delivered: u64,
    bounced: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct CostCounters {
    messages_sent: u64,
    total_cost_cents: u64,
}

pub struct DeliveryManager {
    channel: ChannelType,
    providers: RwLock<Vec<Arc<RegisteredProvider>>>,
    health: ProviderHealthTracker,
    /// Set after a role swap; the preferred provider is moved to the front
    /// of the healthy selection order.
    preferred: RwLock<Option<String>>,
    /// Webhook-fed delivery statistics, per provider.
    stats: DashMap<String, StatsCounters>,
    costs: DashMap<String, CostCounters>,
    /// Tracking records keyed by external message id.
    tracking: Arc<DashMap<String, TrackingRecord>>,
    events: EventBus,
    cleanup_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeliveryManager {
    pub fn new(channel: ChannelType, events: EventBus) -> Self {
        info!(channel = %channel, "DeliveryManager initialized");
        Self {
            channel,
            providers: RwLock::new(Vec::new()),
            health: ProviderHealthTracker::new(),
            preferred: RwLock::new(None),
            stats: DashMap::new(),
            costs: DashMap::new(),
            tracking: Arc::new(DashMap::new()),
            events,
            cleanup_handle: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Add a provider to the pool. No two providers share an identity and
    /// every provider must serve this manager's channel.
    pub fn register(&self, provider: Provider) -> Result<()> {
        if provider.channel != self.channel {
            return Err(DeliveryError::ChannelMismatch {
                provider: provider.id,
                provider_channel: provider.channel,
                manager_channel: self.channel,
            });
        }

        let mut providers = self.providers.write();
        if providers.iter().any(|rp| rp.provider.id == provider.id) {
            return Err(DeliveryError::DuplicateProvider(provider.id));
        }

        info!(
            provider_id = %provider.id,
            channel = %provider.channel,
            priority = provider.priority,
            "Provider registered"
        );

        self.health.register(&provider.id);
        self.costs.entry(provider.id.clone()).or_default();
        self.stats.entry(provider.id.clone()).or_default();

        let limiter = ProviderRateLimiter::new(provider.max_per_second, provider.max_per_day);
        providers.push(Arc::new(RegisteredProvider { provider, limiter }));
        providers.sort_by_key(|rp| rp.provider.priority);
        Ok(())
    }

    /// Current primary/backup provider identities.
    pub fn select_providers(&self) -> Result<(String, Option<String>)> {
        let (primary, backup) = self.select()?;
        Ok((
            primary.provider.id.clone(),
            backup.map(|b| b.provider.id.clone()),
        ))
    }

    fn select(&self) -> Result<(Arc<RegisteredProvider>, Option<Arc<RegisteredProvider>>)> {
        let mut healthy: Vec<Arc<RegisteredProvider>> = {
            let providers = self.providers.read();
            providers
                .iter()
                .filter(|rp| self.health.is_healthy(&rp.provider.id))
                .cloned()
                .collect()
        };

        // Registration keeps the pool priority-sorted; re-sorting here keeps
        // selection correct regardless.
        healthy.sort_by_key(|rp| rp.provider.priority);

        if let Some(preferred_id) = self.preferred.read().clone() {
            if let Some(pos) = healthy
                .iter()
                .position(|rp| rp.provider.id == preferred_id)
            {
                let preferred = healthy.remove(pos);
                healthy.insert(0, preferred);
            }
        }

        let mut iter = healthy.into_iter();
        let primary = iter
            .next()
            .ok_or(DeliveryError::ProviderUnavailable(self.channel))?;
        Ok((primary, iter.next()))
    }

    /// Deliver a single request through the best available provider with one
    /// failover hop. Rate-limit rejection and transport failure stay
    /// distinct: a rate-limited provider is skipped without a health mark.
    pub async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResult> {
        validate_address(&request.recipient)?;
        let (primary, backup) = self.select()?;

        let mut last_send_error: Option<String> = None;
        let mut last_rate_limited: Option<String> = None;

        match primary.limiter.try_acquire() {
            Ok(()) => match self.attempt(&primary, request).await {
                Ok(receipt) => return Ok(self.finish_success(&primary, receipt, false)),
                Err(e) => last_send_error = Some(e),
            },
            Err(window) => {
                debug!(
                    provider_id = %primary.provider.id,
                    window = ?window,
                    "Primary rate limited, trying backup"
                );
                last_rate_limited = Some(primary.provider.id.clone());
            }
        }

        if let Some(backup) = backup {
            match backup.limiter.try_acquire() {
                Ok(()) => match self.attempt(&backup, request).await {
                    Ok(receipt) => {
                        let result = self.finish_success(&backup, receipt, true);
                        self.evaluate_switch(&primary, &backup);
                        return Ok(result);
                    }
                    Err(e) => last_send_error = Some(e),
                },
                Err(window) => {
                    debug!(
                        provider_id = %backup.provider.id,
                        window = ?window,
                        "Backup rate limited"
                    );
                    if last_send_error.is_none() {
                        last_rate_limited = Some(backup.provider.id.clone());
                    }
                }
            }
        }

        match (last_send_error, last_rate_limited) {
            (Some(e), _) => Err(DeliveryError::DeliveryFailed(e)),
            (None, Some(provider_id)) => Err(DeliveryError::RateLimitExceeded(provider_id)),
            (None, None) => Err(DeliveryError::ProviderUnavailable(self.channel)),
        }
    }

    /// One transport attempt with health bookkeeping and event publication.
    async fn attempt(
        &self,
        rp: &RegisteredProvider,
        request: &DeliveryRequest,
    ) -> std::result::Result<TransportReceipt, String> {
        let provider_id = &rp.provider.id;

        match rp.provider.transport.send(&request.recipient, request).await {
            Ok(receipt) => {
                let transition = self.health.record_success(provider_id);
                self.publish_health(provider_id);
                if transition == HealthTransition::Recovered {
                    info!(provider_id = %provider_id, "Provider restored to rotation");
                }
                Ok(receipt)
            }
            Err(e) => {
                let transition = self.health.record_failure(provider_id);
                self.publish_health(provider_id);
                if transition == HealthTransition::BecameUnhealthy {
                    self.events.publish(PulseEvent::ProviderUnhealthy {
                        provider_id: provider_id.clone(),
                        consecutive_failures: self.health.consecutive_failures(provider_id),
                    });
                }
                warn!(
                    provider_id = %provider_id,
                    error = %e,
                    "Provider send failed"
                );
                Err(e.to_string())
            }
        }
    }

    fn publish_health(&self, provider_id: &str) {
        self.events.publish(PulseEvent::ProviderHealthUpdate {
            provider_id: provider_id.to_string(),
            healthy: self.health.is_healthy(provider_id),
            success_rate: self.health.success_rate(provider_id),
        });
    }

    fn finish_success(
        &self,
        rp: &RegisteredProvider,
        receipt: TransportReceipt,
        fallback_used: bool,
    ) -> DeliveryResult {
        let cost = rp.provider.cost_per_message_cents;
        {
            let mut counters = self.costs.entry(rp.provider.id.clone()).or_default();
            counters.messages_sent += 1;
            counters.total_cost_cents += cost as u64;
        }

        info!(
            provider_id = %rp.provider.id,
            external_id = %receipt.external_id,
            fallback_used = fallback_used,
            "Message delivered to provider"
        );

        DeliveryResult {
            success: true,
            provider_id: rp.provider.id.clone(),
            external_message_id: Some(receipt.external_id),
            cost_cents: cost,
            fallback_used,
            error: None,
        }
    }

    /// After a successful fallback: swap primary/backup roles when the
    /// backup's rolling success rate leads by more than the margin and both
    /// providers carry enough observations.
    fn evaluate_switch(&self, primary: &RegisteredProvider, backup: &RegisteredProvider) {
        let primary_rate = self.health.success_rate(&primary.provider.id);
        let backup_rate = self.health.success_rate(&backup.provider.id);
        let primary_samples = self.health.attempts(&primary.provider.id);
        let backup_samples = self.health.attempts(&backup.provider.id);

        if primary_samples < MIN_SWITCH_SAMPLES || backup_samples < MIN_SWITCH_SAMPLES {
            return;
        }
        if backup_rate <= primary_rate + SWITCH_MARGIN {
            return;
        }

        let mut preferred = self.preferred.write();
        if preferred.as_deref() == Some(backup.provider.id.as_str()) {
            return;
        }
        *preferred = Some(backup.provider.id.clone());
        drop(preferred);

        info!(
            channel = %self.channel,
            from_provider = %primary.provider.id,
            to_provider = %backup.provider.id,
            primary_rate = primary_rate,
            backup_rate = backup_rate,
            "Switching primary provider"
        );
        self.events.publish(PulseEvent::ProviderSwitch {
            channel: self.channel,
            from_provider: primary.provider.id.clone(),
            to_provider: backup.provider.id.clone(),
        });
    }

    /// Deliver one payload to many targets in fixed-size batches. Per-target
    /// failures are captured in the report and never abort the bulk.
    pub async fn send_bulk(&self, targets: &[Address], payload: &BulkPayload) -> BulkDeliveryReport {
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut delivered = 0usize;
        let mut failed = 0usize;
        let mut total_cost_cents = 0u64;

        for (batch_index, batch) in targets.chunks(BULK_BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(BULK_BATCH_DELAY).await;
            }

            for target in batch {
                let request = payload.to_request(target.clone());
                match self.send(&request).await {
                    Ok(result) => {
                        delivered += 1;
                        total_cost_cents += result.cost_cents as u64;
                        outcomes.push(BulkOutcome {
                            recipient: target.clone(),
                            success: true,
                            provider_id: Some(result.provider_id),
                            error: None,
                        });
                    }
                    Err(e) => {
                        failed += 1;
                        outcomes.push(BulkOutcome {
                            recipient: target.clone(),
                            success: false,
                            provider_id: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        }

        info!(
            channel = %self.channel,
            total = targets.len(),
            delivered = delivered,
            failed = failed,
            total_cost_cents = total_cost_cents,
            "Bulk delivery complete"
        );

        BulkDeliveryReport {
            total: targets.len(),
            delivered,
            failed,
            total_cost_cents,
            outcomes,
        }
    }

    /// Ingest an asynchronous delivery-status callback from the provider
    /// side.
    pub fn track_delivery(&self, event: WebhookEvent) {
        {
            let mut counters = self.stats.entry(event.provider_id.clone()).or_default();
            match event.event {
                DeliveryEvent::Queued => counters.queued += 1,
                DeliveryEvent::Sent => counters.sent += 1,
                DeliveryEvent::Delivered => counters.delivered += 1,
                DeliveryEvent::Bounced => counters.bounced += 1,
                DeliveryEvent::Failed => counters.failed += 1,
            }
        }

        debug!(
            provider_id = %event.provider_id,
            external_message_id = %event.external_message_id,
            event = ?event.event,
            "Delivery tracking event"
        );

        self.tracking.insert(
            event.external_message_id.clone(),
            TrackingRecord {
                provider_id: event.provider_id.clone(),
                event: event.event,
                recipient: event.recipient.clone(),
                updated_at: event.timestamp,
            },
        );

        self.events.publish(PulseEvent::DeliveryTracking {
            provider_id: event.provider_id,
            external_message_id: event.external_message_id,
            event: event.event,
            recipient: event.recipient,
        });
    }

    pub fn get_health(&self) -> Vec<ProviderHealthSnapshot> {
        self.health.snapshots()
    }

    pub fn get_stats(&self) -> Vec<ProviderStatsSnapshot> {
        self.stats
            .iter()
            .map(|entry| ProviderStatsSnapshot {
                provider_id: entry.key().clone(),
                queued: entry.queued,
                sent: entry.sent,
                delivered: entry.delivered,
                bounced: entry.bounced,
                failed: entry.failed,
            })
            .collect()
    }

    pub fn get_cost_tracking(&self) -> Vec<CostSnapshot> {
        self.costs
            .iter()
            .map(|entry| CostSnapshot {
                provider_id: entry.key().clone(),
                messages_sent: entry.messages_sent,
                total_cost_cents: entry.total_cost_cents,
            })
            .collect()
    }

    /// Number of live tracking records.
    pub fn tracking_len(&self) -> usize {
        self.tracking.len()
    }

    /// Start background maintenance (tracking-record retention).
    pub fn start(&self) {
        let mut handle = self.cleanup_handle.lock();
        if handle.is_some() {
            return;
        }

        let tracking = Arc::clone(&self.tracking);
        let channel = self.channel;
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TRACKING_CLEANUP_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let cutoff = Utc::now() - chrono::Duration::hours(TRACKING_RETENTION_HOURS);
                let before = tracking.len();
                tracking.retain(|_, record| record.updated_at > cutoff);
                let removed = before.saturating_sub(tracking.len());
                if removed > 0 {
                    debug!(channel = %channel, removed = removed, "Purged stale tracking records");
                }
            }
        }));
        info!(channel = %self.channel, "DeliveryManager maintenance started");
    }

    /// Stop background maintenance.
    pub fn shutdown(&self) {
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
            info!(channel = %self.channel, "DeliveryManager maintenance stopped");
        }
    }
}

impl Drop for DeliveryManager {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
        }
    }
}
