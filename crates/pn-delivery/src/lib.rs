//! PulseNotify Delivery - multi-provider notification delivery
//!
//! Provides:
//! - `DeliveryManager`: per-channel provider pool with priority selection,
//!   one-hop failover and role switching
//! - `ProviderHealthTracker`: consecutive-failure health records
//! - `ProviderRateLimiter`: per-second and per-day send ceilings
//! - Transport adapters for HTTP/webhook and SMTP providers

pub mod error;
pub mod health;
pub mod manager;
pub mod provider;
pub mod rate_limit;
pub mod transport;

pub use error::{DeliveryError, Result};
pub use health::{HealthTransition, ProviderHealthTracker, UNHEALTHY_THRESHOLD};
pub use manager::{DeliveryManager, MIN_SWITCH_SAMPLES};
pub use provider::{validate_address, Provider, ProviderTransport, TransportError, TransportReceipt};
pub use rate_limit::{ProviderRateLimiter, RateWindow};
pub use transport::{HttpWebhookTransport, SmtpTransport};
