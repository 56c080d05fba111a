//! Realtime Connection & Broadcast Service
//!
//! Tracks authenticated connections keyed by recipient identity and role,
//! delivers immediately to online recipients, parks notifications for
//! offline recipients, sweeps stale connections on a heartbeat, and runs
//! batched role-wide and global broadcasts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use pn_common::{EventBus, Notification, PulseEvent, Role};

use crate::connection::{Connection, Session};
use crate::error::{RealtimeError, Result};
use crate::offline::OfflineQueue;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
    /// A connection idle for longer than `stale_multiplier x
    /// heartbeat_interval` is force-closed.
    pub stale_multiplier: u32,
    pub offline_queue_cap: usize,
    pub offline_retention: chrono::Duration,
    pub broadcast_batch_size: usize,
    pub broadcast_batch_delay: Duration,
    pub cleanup_interval: Duration,
    pub tracking_retention: chrono::Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_multiplier: 3,
            offline_queue_cap: 100,
            offline_retention: chrono::Duration::days(7),
            broadcast_batch_size: 50,
            broadcast_batch_delay: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
            tracking_retention: chrono::Duration::hours(24),
        }
    }
}

/// Outcome of a single realtime send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Pushed to a live session.
    Delivered,
    /// Recipient offline; parked in their queue.
    Queued { queue_len: usize },
    /// Recipient online but the session push failed.
    Failed { error: String },
}

/// Aggregate counts for a batched broadcast.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub online: usize,
    pub offline: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Per-recipient delivery tracking record.
#[derive(Debug, Clone)]
pub struct NotificationTrace {
    pub user_id: String,
    pub notification_id: String,
    pub delivered_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub read: bool,
    pub updated_at: DateTime<Utc>,
}

fn trace_key(user_id: &str, notification_id: &str) -> String {
    format!("{}:{}", user_id, notification_id)
}

pub struct RealtimeService {
    config: RealtimeConfig,
    connections: DashMap<String, Arc<Connection>>,
    /// Connected identities grouped by role.
    roles: DashMap<Role, HashSet<String>>,
    /// Every identity the service has ever seen, with its role. Broadcast
    /// targets come from here so offline recipients still receive queued
    /// copies.
    directory: DashMap<String, Role>,
    offline: OfflineQueue,
    tracking: DashMap<String, NotificationTrace>,
    events: EventBus,
    task_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RealtimeService {
    pub fn new(config: RealtimeConfig, events: EventBus) -> Arc<Self> {
        let offline = OfflineQueue::new(config.offline_queue_cap, config.offline_retention);
        Arc::new(Self {
            config,
            connections: DashMap::new(),
            roles: DashMap::new(),
            directory: DashMap::new(),
            offline,
            tracking: DashMap::new(),
            events,
            task_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Make an identity a known broadcast target without a live connection.
    pub fn register_recipient(&self, user_id: &str, role: Role) {
        self.directory.insert(user_id.to_string(), role);
    }

    /// Register an authenticated connection, join its role group and replay
    /// the recipient's offline queue in enqueue order. Returns the number of
    /// replayed notifications.
    pub async fn authenticate(
        &self,
        user_id: &str,
        role: Role,
        session: Arc<dyn Session>,
    ) -> usize {
        // A reconnect replaces any live session. The old connection leaves
        // its role group first so a role change cannot strand membership.
        self.remove_connection(user_id, "replaced by new session");

        let conn = Arc::new(Connection::new(user_id, role, session));
        self.directory.insert(user_id.to_string(), role);
        self.connections.insert(user_id.to_string(), Arc::clone(&conn));
        self.roles
            .entry(role)
            .or_default()
            .insert(user_id.to_string());

        info!(user_id = %user_id, role = %role, "User connected");
        self.events.publish(PulseEvent::UserConnected {
            user_id: user_id.to_string(),
            role,
        });

        // Offline replay: each queued entry is delivered exactly once and
        // the queue is already cleared by the drain.
        let pending = self.offline.drain(user_id);
        let mut replayed = 0usize;
        for notification in pending {
            let require_ack = notification.requires_ack();
            match conn.session.deliver(&notification, require_ack).await {
                Ok(()) => {
                    self.record_delivery(user_id, &notification);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        notification_id = %notification.id,
                        error = %e,
                        "Offline replay delivery failed, entry dropped"
                    );
                }
            }
        }

        if replayed > 0 {
            info!(user_id = %user_id, replayed = replayed, "Offline queue replayed");
        }
        replayed
    }

    /// Explicit close from the client or its transport.
    pub fn disconnect(&self, user_id: &str, reason: &str) -> Result<()> {
        if self.remove_connection(user_id, reason) {
            Ok(())
        } else {
            Err(RealtimeError::NotAuthenticated(user_id.to_string()))
        }
    }

    fn remove_connection(&self, user_id: &str, reason: &str) -> bool {
        let Some((_, conn)) = self.connections.remove(user_id) else {
            return false;
        };

        if let Some(mut members) = self.roles.get_mut(&conn.role) {
            members.remove(user_id);
        }

        info!(user_id = %user_id, reason = %reason, "User disconnected");
        self.events.publish(PulseEvent::UserDisconnected {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Deliver to an online recipient or park for an offline one.
    pub async fn send_to_recipient(
        &self,
        user_id: &str,
        notification: Notification,
    ) -> SendOutcome {
        let conn = self
            .connections
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()));

        let Some(conn) = conn else {
            let queue_len = self.offline.enqueue(user_id, notification);
            debug!(user_id = %user_id, queue_len = queue_len, "Recipient offline, notification queued");
            return SendOutcome::Queued { queue_len };
        };

        let require_ack = notification.requires_ack();
        match conn.session.deliver(&notification, require_ack).await {
            Ok(()) => {
                conn.touch();
                self.record_delivery(user_id, &notification);
                SendOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    notification_id = %notification.id,
                    error = %e,
                    "Session delivery failed"
                );
                SendOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn record_delivery(&self, user_id: &str, notification: &Notification) {
        let now = Utc::now();
        self.tracking.insert(
            trace_key(user_id, &notification.id),
            NotificationTrace {
                user_id: user_id.to_string(),
                notification_id: notification.id.clone(),
                delivered_at: now,
                acknowledged: false,
                read: false,
                updated_at: now,
            },
        );
    }

    /// Batched broadcast to every known recipient in a role group.
    pub async fn broadcast_to_role(&self, role: Role, notification: &Notification) -> BroadcastReport {
        let targets = self.targets(Some(role));
        self.broadcast(targets, notification).await
    }

    /// Batched broadcast to every known recipient.
    pub async fn broadcast_to_all(&self, notification: &Notification) -> BroadcastReport {
        let targets = self.targets(None);
        self.broadcast(targets, notification).await
    }

    fn targets(&self, role: Option<Role>) -> Vec<String> {
        let mut targets: Vec<String> = self
            .directory
            .iter()
            .filter(|entry| role.map_or(true, |r| *entry.value() == r))
            .map(|entry| entry.key().clone())
            .collect();
        // Stable batch composition across identical directory states.
        targets.sort();
        targets
    }

    async fn broadcast(&self, targets: Vec<String>, notification: &Notification) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (batch_index, batch) in targets.chunks(self.config.broadcast_batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.config.broadcast_batch_delay).await;
            }

            for user_id in batch {
                match self.send_to_recipient(user_id, notification.clone()).await {
                    SendOutcome::Delivered => {
                        report.online += 1;
                        report.delivered += 1;
                    }
                    SendOutcome::Queued { .. } => {
                        report.offline += 1;
                    }
                    SendOutcome::Failed { .. } => {
                        report.online += 1;
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            total = targets.len(),
            online = report.online,
            offline = report.offline,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    /// Inbound acknowledgment or read receipt from a connected client.
    /// Updates the tracking record and publishes the event; never blocks a
    /// sender.
    pub fn acknowledge(&self, user_id: &str, notification_id: &str, read: bool) -> Result<()> {
        let conn = self
            .connections
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RealtimeError::NotAuthenticated(user_id.to_string()))?;
        conn.touch();

        if let Some(mut trace) = self.tracking.get_mut(&trace_key(user_id, notification_id)) {
            trace.acknowledged = true;
            trace.read = read;
            trace.updated_at = Utc::now();
        }

        debug!(
            user_id = %user_id,
            notification_id = %notification_id,
            read = read,
            "Notification acknowledged"
        );
        self.events.publish(PulseEvent::NotificationAcknowledged {
            user_id: user_id.to_string(),
            notification_id: notification_id.to_string(),
            read,
        });
        Ok(())
    }

    pub fn get_tracking(&self, user_id: &str, notification_id: &str) -> Option<NotificationTrace> {
        self.tracking
            .get(&trace_key(user_id, notification_id))
            .map(|t| t.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    /// Connected identities in a role group.
    pub fn connected_by_role(&self, role: Role) -> Vec<String> {
        self.roles
            .get(&role)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn offline_queue_len(&self, user_id: &str) -> usize {
        self.offline.len(user_id)
    }

    /// Ping live sessions and force-close connections idle past the stale
    /// threshold.
    async fn sweep_connections(&self) {
        let stale_after = self.config.heartbeat_interval * self.config.stale_multiplier;
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for conn in connections {
            if conn.idle_for() > stale_after {
                warn!(
                    user_id = %conn.user_id,
                    idle = ?conn.idle_for(),
                    "Connection stale, forcing close"
                );
                self.remove_connection(&conn.user_id, "stale heartbeat");
                continue;
            }

            if let Err(e) = conn.session.ping().await {
                warn!(user_id = %conn.user_id, error = %e, "Heartbeat ping failed, closing");
                self.remove_connection(&conn.user_id, "ping failed");
            }
        }
    }

    /// Purge expired offline entries and stale tracking records.
    fn cleanup_once(&self) {
        self.offline.purge_expired();

        let cutoff = Utc::now() - self.config.tracking_retention;
        let before = self.tracking.len();
        self.tracking.retain(|_, trace| trace.updated_at > cutoff);
        let removed = before.saturating_sub(self.tracking.len());
        if removed > 0 {
            debug!(removed = removed, "Purged stale tracking records");
        }
    }

    /// Start the heartbeat and cleanup tasks.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.task_handles.lock();
        if !handles.is_empty() {
            return;
        }

        let service = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.heartbeat_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                service.sweep_connections().await;
            }
        }));

        let service = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                service.cleanup_once();
            }
        }));

        info!("RealtimeService tasks started");
    }

    /// Stop background tasks. Connections stay registered.
    pub fn shutdown(&self) {
        let mut handles = self.task_handles.lock();
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("RealtimeService tasks stopped");
    }
}
