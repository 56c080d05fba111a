//! Typed event channel for cross-component notifications
//!
//! All components publish into a single closed set of event variants over a
//! tokio broadcast channel. Publishing never blocks; slow subscribers lag
//! and lose the oldest events rather than applying backpressure.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{ChannelType, DeliveryEvent, Role};

/// Default broadcast capacity before slow subscribers start lagging.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Every event the notification core can emit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PulseEvent {
    ProviderHealthUpdate {
        provider_id: String,
        healthy: bool,
        success_rate: f64,
    },
    ProviderUnhealthy {
        provider_id: String,
        consecutive_failures: u32,
    },
    ProviderSwitch {
        channel: ChannelType,
        from_provider: String,
        to_provider: String,
    },
    DeliveryTracking {
        provider_id: String,
        external_message_id: String,
        event: DeliveryEvent,
        recipient: Option<String>,
    },
    UserConnected {
        user_id: String,
        role: Role,
    },
    UserDisconnected {
        user_id: String,
        reason: String,
    },
    NotificationAcknowledged {
        user_id: String,
        notification_id: String,
        read: bool,
    },
}

/// Broadcast bus shared by the delivery manager, realtime service and their
/// observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PulseEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A send error only means there are currently no
    /// subscribers, which is not a failure.
    pub fn publish(&self, event: PulseEvent) {
        trace!(event = ?event, "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PulseEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
