//! Bounded per-recipient offline queues
//!
//! Notifications for disconnected recipients wait here until the next
//! successful authentication. Each queue is bounded (oldest dropped first)
//! and every entry carries an absolute expiry; replay is strictly FIFO by
//! enqueue time.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use pn_common::Notification;

/// A notification parked for a disconnected recipient.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub notification: Notification,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct OfflineQueue {
    queues: DashMap<String, VecDeque<QueuedNotification>>,
    cap_per_recipient: usize,
    retention: Duration,
}

impl OfflineQueue {
    pub fn new(cap_per_recipient: usize, retention: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            cap_per_recipient,
            retention,
        }
    }

    /// Park a notification. When the recipient's queue is full the oldest
    /// entry is dropped to make room. Returns the queue length afterward.
    pub fn enqueue(&self, user_id: &str, notification: Notification) -> usize {
        let now = Utc::now();
        let mut queue = self.queues.entry(user_id.to_string()).or_default();

        if queue.len() >= self.cap_per_recipient {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    user_id = %user_id,
                    notification_id = %dropped.notification.id,
                    "Offline queue full, dropping oldest entry"
                );
            }
        }

        queue.push_back(QueuedNotification {
            notification,
            queued_at: now,
            expires_at: now + self.retention,
        });
        queue.len()
    }

    /// Remove and return all live entries for a recipient in enqueue order.
    /// Expired entries are discarded, never replayed.
    pub fn drain(&self, user_id: &str) -> Vec<Notification> {
        let Some((_, queue)) = self.queues.remove(user_id) else {
            return Vec::new();
        };

        let now = Utc::now();
        queue
            .into_iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.notification)
            .collect()
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.queues.get(user_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, user_id: &str) -> bool {
        self.len(user_id) == 0
    }

    /// Drop every entry past its expiry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        for mut entry in self.queues.iter_mut() {
            let before = entry.len();
            entry.retain(|queued| queued.expires_at > now);
            removed += before - entry.len();
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        if removed > 0 {
            debug!(removed = removed, "Purged expired offline notifications");
        }
        removed
    }
}
