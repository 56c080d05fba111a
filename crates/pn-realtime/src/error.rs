use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    /// A realtime operation referenced an identity with no authenticated
    /// connection.
    #[error("Connection not authenticated: {0}")]
    NotAuthenticated(String),
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
