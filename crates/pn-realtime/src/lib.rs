//! PulseNotify Realtime - connection tracking and broadcast delivery
//!
//! Provides:
//! - `RealtimeService`: authenticated connection registry with role groups,
//!   heartbeat liveness sweeps and batched broadcasts
//! - `OfflineQueue`: bounded, TTL-stamped per-recipient queues with FIFO
//!   replay on reconnect
//! - `Session`: the transport-specific push boundary

pub mod connection;
pub mod error;
pub mod offline;
pub mod service;

pub use connection::{Connection, Session, SessionError};
pub use error::{RealtimeError, Result};
pub use offline::{OfflineQueue, QueuedNotification};
pub use service::{
    BroadcastReport, NotificationTrace, RealtimeConfig, RealtimeService, SendOutcome,
};
