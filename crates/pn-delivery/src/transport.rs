//! Transport adapters for the opaque provider boundary
//!
//! Provides:
//! - `HttpWebhookTransport`: JSON POST to a provider's HTTP ingestion endpoint
//! - `SmtpTransport`: async SMTP relay via lettre
//!
//! Adapters translate one request into one provider call and classify the
//! response; retry and failover stay in the manager.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use pn_common::{Address, DeliveryRequest, Priority};

use crate::provider::{ProviderTransport, TransportError, TransportReceipt};

/// Payload posted to an HTTP provider endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSendPayload<'a> {
    recipient: &'a str,
    subject: Option<&'a str>,
    body: &'a str,
    priority: Priority,
}

/// Response expected from an HTTP provider endpoint.
#[derive(Debug, Deserialize, Default)]
struct WebhookSendResponse {
    id: Option<String>,
}

/// HTTP/webhook provider transport (push-style providers and SMS gateways
/// with HTTP ingestion).
pub struct HttpWebhookTransport {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpWebhookTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[async_trait]
impl ProviderTransport for HttpWebhookTransport {
    async fn send(
        &self,
        address: &Address,
        request: &DeliveryRequest,
    ) -> Result<TransportReceipt, TransportError> {
        let payload = WebhookSendPayload {
            recipient: address.as_str(),
            subject: request.subject.as_deref(),
            body: &request.body,
            priority: request.priority,
        };

        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(ref token) = self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                status = %status,
                body = %body,
                endpoint = %self.endpoint,
                "Provider endpoint rejected message"
            );
            return Err(TransportError::Rejected(format!("HTTP {}", status)));
        }

        let parsed: WebhookSendResponse = response.json().await.unwrap_or_default();
        let external_id = parsed
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        debug!(external_id = %external_id, "Provider accepted message");
        Ok(TransportReceipt { external_id })
    }
}

/// SMTP mail transport.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(
        relay: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        from: &str,
    ) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(relay)?
            .credentials(Credentials::new(username.into(), password.into()))
            .build();
        let from = from.parse::<Mailbox>()?;

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl ProviderTransport for SmtpTransport {
    async fn send(
        &self,
        address: &Address,
        request: &DeliveryRequest,
    ) -> Result<TransportReceipt, TransportError> {
        let to = match address {
            Address::Email(s) => s
                .parse::<Mailbox>()
                .map_err(|e| TransportError::Rejected(format!("Bad mailbox: {}", e)))?,
            Address::Phone(_) => {
                return Err(TransportError::Rejected(
                    "SMTP transport cannot address a phone number".to_string(),
                ))
            }
        };

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(request.subject.clone().unwrap_or_default())
            .body(request.body.clone())
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if !response.is_positive() {
            return Err(TransportError::Rejected(format!(
                "SMTP response code {}",
                response.code()
            )));
        }

        // SMTP has no canonical message id on the submission path
        Ok(TransportReceipt {
            external_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}
