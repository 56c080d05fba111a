//! Provider registration types and the opaque transport boundary
//!
//! A `Provider` is a concrete external transport implementing one channel.
//! It is immutable after registration; the manager owns all mutable state
//! (health, rate counters, stats) keyed by provider identity.

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use pn_common::{Address, ChannelType, DeliveryRequest};

use crate::error::{DeliveryError, Result};

/// Receipt returned by a transport for an accepted message.
#[derive(Debug, Clone)]
pub struct TransportReceipt {
    /// Message identifier assigned by the external provider.
    pub external_id: String,
}

/// Errors crossing the transport boundary.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport rejected the message: {0}")]
    Rejected(String),

    #[error("Transport connection failed: {0}")]
    Connection(String),
}

/// Opaque request/response boundary to an external delivery network.
///
/// Implementations must not retry internally; failover and retry policy
/// belong to the `DeliveryManager`.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(
        &self,
        address: &Address,
        request: &DeliveryRequest,
    ) -> std::result::Result<TransportReceipt, TransportError>;
}

/// A registered delivery provider. Lower priority is preferred.
#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub channel: ChannelType,
    pub priority: u32,
    pub features: Vec<String>,
    /// Per-second send ceiling. None = unlimited.
    pub max_per_second: Option<u32>,
    /// Per-day send ceiling. None = unlimited.
    pub max_per_day: Option<u64>,
    pub cost_per_message_cents: u32,
    pub transport: Arc<dyn ProviderTransport>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        channel: ChannelType,
        priority: u32,
        transport: Arc<dyn ProviderTransport>,
    ) -> Self {
        Self {
            id: id.into(),
            channel,
            priority,
            features: Vec::new(),
            max_per_second: None,
            max_per_day: None,
            cost_per_message_cents: 0,
            transport,
        }
    }

    pub fn with_rate_limits(mut self, max_per_second: Option<u32>, max_per_day: Option<u64>) -> Self {
        self.max_per_second = max_per_second;
        self.max_per_day = max_per_day;
        self
    }

    pub fn with_cost(mut self, cost_per_message_cents: u32) -> Self {
        self.cost_per_message_cents = cost_per_message_cents;
        self
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("priority", &self.priority)
            .field("max_per_second", &self.max_per_second)
            .field("max_per_day", &self.max_per_day)
            .field("cost_per_message_cents", &self.cost_per_message_cents)
            .finish()
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

fn phone_regex() -> &'static Regex {
    // E.164: + followed by 8..15 digits
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9]\d{7,14}$").expect("static regex"))
}

/// Validate channel-specific addressing before any provider is consulted.
pub fn validate_address(address: &Address) -> Result<()> {
    let valid = match address {
        Address::Email(s) => email_regex().is_match(s),
        Address::Phone(s) => phone_regex().is_match(s),
    };

    if valid {
        Ok(())
    } else {
        Err(DeliveryError::InvalidRecipient(address.as_str().to_string()))
    }
}
