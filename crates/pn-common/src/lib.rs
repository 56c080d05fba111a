use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod event;
pub mod logging;

pub use event::{EventBus, PulseEvent};

// ============================================================================
// Channels & Addressing
// ============================================================================

/// Delivery medium for an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Email => write!(f, "email"),
            ChannelType::Sms => write!(f, "sms"),
            ChannelType::Push => write!(f, "push"),
        }
    }
}

/// Notification priority. High and Critical demand acknowledgment on the
/// realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Channel-specific addressing for a delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Address {
    Email(String),
    Phone(String),
}

impl Address {
    pub fn channel(&self) -> ChannelType {
        match self {
            Address::Email(_) => ChannelType::Email,
            Address::Phone(_) => ChannelType::Sms,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Address::Email(s) | Address::Phone(s) => s,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Delivery Types
// ============================================================================

/// A single outbound delivery, already rendered and authorized upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub recipient: Address,
    pub subject: Option<String>,
    pub body: String,
    pub priority: Priority,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeliveryRequest {
    pub fn new(recipient: Address, body: impl Into<String>) -> Self {
        Self {
            recipient,
            subject: None,
            body: body.into(),
            priority: Priority::Normal,
            metadata: HashMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a single delivery attempt through the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_id: String,
    pub external_message_id: Option<String>,
    pub cost_cents: u32,
    pub fallback_used: bool,
    pub error: Option<String>,
}

/// Rendered content shared by every target of a bulk delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPayload {
    pub subject: Option<String>,
    pub body: String,
    pub priority: Priority,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BulkPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
            priority: Priority::Normal,
            metadata: HashMap::new(),
        }
    }

    /// Expand this payload into a single-target delivery request.
    pub fn to_request(&self, recipient: Address) -> DeliveryRequest {
        DeliveryRequest {
            recipient,
            subject: self.subject.clone(),
            body: self.body.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
        }
    }
}

/// Per-target outcome inside a bulk delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub recipient: Address,
    pub success: bool,
    pub provider_id: Option<String>,
    pub error: Option<String>,
}

/// Aggregate result of a bulk delivery. Partial failures never abort the
/// bulk; they are captured per target here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeliveryReport {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub total_cost_cents: u64,
    pub outcomes: Vec<BulkOutcome>,
}

// ============================================================================
// Webhook Tracking Types
// ============================================================================

/// Delivery-status event reported asynchronously by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryEvent {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Failed,
}

/// Asynchronous delivery-status callback from the provider side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub provider_id: String,
    pub external_message_id: String,
    pub event: DeliveryEvent,
    pub timestamp: DateTime<Utc>,
    pub recipient: Option<String>,
}

// ============================================================================
// Realtime Types
// ============================================================================

/// Role group a connected user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Pharmacy,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Doctor => write!(f, "doctor"),
            Role::Pharmacy => write!(f, "pharmacy"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Payload pushed to a realtime recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Notification {
    pub fn new(
        category: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category: category.into(),
            title: title.into(),
            body: body.into(),
            priority,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Whether delivery of this notification demands an acknowledgment.
    pub fn requires_ack(&self) -> bool {
        self.priority >= Priority::High
    }
}

// ============================================================================
// Observability Snapshots
// ============================================================================

/// Read-only view of a provider's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthSnapshot {
    pub provider_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_success: u64,
    pub total_failure: u64,
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Per-provider delivery statistics fed by webhook callbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatsSnapshot {
    pub provider_id: String,
    pub queued: u64,
    pub sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub failed: u64,
}

/// Per-provider spend tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    pub provider_id: String,
    pub messages_sent: u64,
    pub total_cost_cents: u64,
}
