//! PulseNotify Cache - tiered template cache
//!
//! Provides:
//! - `TemplateCache`: four LRU+TTL tiers (raw, compiled, rendered,
//!   metadata) with fragment/pattern/tag invalidation, warm-up, metrics
//!   and a health check

pub mod engine;
pub mod error;

pub use engine::{
    CacheConfig, CacheHealth, CacheMetrics, CacheOptions, CacheTier, TemplateCache, TierConfig,
    TierMetrics, WarmEntry,
};
pub use error::{CacheError, Result};
