//! Live connection state and the session push boundary
//!
//! A `Session` is the transport-specific half of a connection (socket,
//! server-sent events, test fake). The service owns everything else:
//! identity, role membership and activity timestamps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use pn_common::{Notification, Role};

/// Errors crossing the session boundary.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session transport failed: {0}")]
    Transport(String),

    #[error("Session is closed")]
    Closed,
}

/// Push boundary to a connected client.
///
/// Implementations must not retry or buffer internally; offline queueing is
/// the service's job.
#[async_trait]
pub trait Session: Send + Sync {
    /// Push one notification. `require_ack` asks the client to confirm
    /// receipt via `acknowledge`.
    async fn deliver(
        &self,
        notification: &Notification,
        require_ack: bool,
    ) -> std::result::Result<(), SessionError>;

    /// Liveness ping.
    async fn ping(&self) -> std::result::Result<(), SessionError>;
}

/// An authenticated connection.
pub struct Connection {
    pub user_id: String,
    pub role: Role,
    pub session: Arc<dyn Session>,
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, role: Role, session: Arc<dyn Session>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            session,
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Mark client activity (delivery ack, inbound message, reconnect).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last observed client activity.
    pub fn idle_for(&self) -> tokio::time::Duration {
        self.last_activity.lock().elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
