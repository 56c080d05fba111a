use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The caller-supplied compute function raised. The cause propagates
    /// unchanged; nothing partial is stored.
    #[error("Cache compute failed: {0}")]
    ComputeFailed(anyhow::Error),

    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
