//! Per-provider rate limiting
//!
//! Two independent ceilings per provider: a per-second token bucket
//! (governor) and a fixed-memory day-window counter. The day counter is
//! monotonic within its window and resets exactly once at rollover.
//! Breaching either ceiling is a synchronous rejection, never a health
//! failure.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::debug;

/// Which ceiling rejected the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    PerSecond,
    PerDay,
}

pub struct ProviderRateLimiter {
    per_second: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    max_per_day: Option<u64>,
    day_count: AtomicU64,
    day_window: parking_lot::Mutex<NaiveDate>,
}

impl ProviderRateLimiter {
    pub fn new(max_per_second: Option<u32>, max_per_day: Option<u64>) -> Self {
        let per_second = max_per_second.and_then(|rps| {
            NonZeroU32::new(rps).map(|nz| Arc::new(RateLimiter::direct(Quota::per_second(nz))))
        });

        Self {
            per_second,
            max_per_day: max_per_day.filter(|&limit| limit > 0),
            day_count: AtomicU64::new(0),
            day_window: parking_lot::Mutex::new(Utc::now().date_naive()),
        }
    }

    /// Reset the day counter exactly once when the UTC day rolls over.
    fn roll_day_window(&self) {
        let today = Utc::now().date_naive();
        let mut window = self.day_window.lock();
        if *window != today {
            debug!(old_window = %window, new_window = %today, "Day rate window rolled over");
            *window = today;
            self.day_count.store(0, Ordering::SeqCst);
        }
    }

    /// Try to take one send permit. On success the day counter is consumed.
    pub fn try_acquire(&self) -> Result<(), RateWindow> {
        if self.max_per_day.is_some() {
            self.roll_day_window();
        }

        if let Some(limit) = self.max_per_day {
            if self.day_count.load(Ordering::SeqCst) >= limit {
                return Err(RateWindow::PerDay);
            }
        }

        if let Some(ref limiter) = self.per_second {
            if limiter.check().is_err() {
                return Err(RateWindow::PerSecond);
            }
        }

        if self.max_per_day.is_some() {
            self.day_count.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Sends consumed in the current day window.
    pub fn day_count(&self) -> u64 {
        self.day_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_acquires() {
        let limiter = ProviderRateLimiter::new(None, None);
        for _ in 0..1000 {
            assert!(limiter.try_acquire().is_ok());
        }
    }

    #[test]
    fn test_per_second_ceiling() {
        let limiter = ProviderRateLimiter::new(Some(1), None);

        assert!(limiter.try_acquire().is_ok());
        // Second acquisition within the same second is rejected
        assert_eq!(limiter.try_acquire(), Err(RateWindow::PerSecond));
    }

    #[test]
    fn test_per_day_ceiling() {
        let limiter = ProviderRateLimiter::new(None, Some(2));

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.try_acquire(), Err(RateWindow::PerDay));
        assert_eq!(limiter.day_count(), 2);
    }

    #[test]
    fn test_per_second_rejection_does_not_consume_day_quota() {
        let limiter = ProviderRateLimiter::new(Some(1), Some(10));

        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.try_acquire(), Err(RateWindow::PerSecond));
        assert_eq!(limiter.day_count(), 1);
    }
}
