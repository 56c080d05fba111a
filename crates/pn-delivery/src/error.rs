use pn_common::ChannelType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No healthy provider available for channel {0}")]
    ProviderUnavailable(ChannelType),

    #[error("Rate limit exceeded for provider {0}")]
    RateLimitExceeded(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Delivery failed on all providers: {0}")]
    DeliveryFailed(String),

    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("Provider {provider} targets channel {provider_channel}, manager handles {manager_channel}")]
    ChannelMismatch {
        provider: String,
        provider_channel: ChannelType,
        manager_channel: ChannelType,
    },
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
