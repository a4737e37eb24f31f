//! Admission trait for abstracting over the limiter algorithms.

use serde::Serialize;

use super::limiter::{RateLimiter, WindowLimiter};
use crate::error::Result;

/// Outcome of admitting one unit of work for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// Capacity left for the key after this decision
    pub remaining: i64,
}

impl Decision {
    /// An admitted unit of work.
    pub fn allowed(remaining: i64) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    /// A throttled unit of work.
    pub fn rejected(remaining: i64) -> Self {
        Self {
            allowed: false,
            remaining,
        }
    }
}

/// Trait for limiter implementations.
///
/// This trait abstracts over the token bucket and windowed limiters so a
/// facade can work with either.
pub trait Admission: Send + Sync {
    /// Account one unit of work for `key` and decide whether it is allowed.
    ///
    /// Throttling is reported through [`Decision::allowed`]; only an invalid key is
    /// an error.
    fn admit(&self, key: &str) -> Result<Decision>;

    /// Release all per-key state.
    fn shutdown(&self);
}

impl Admission for RateLimiter {
    fn admit(&self, key: &str) -> Result<Decision> {
        self.with_bucket(key, |bucket| match bucket.try_consume(1) {
            Ok(remaining) => Decision::allowed(remaining),
            Err(available) => Decision::rejected(available),
        })
    }

    fn shutdown(&self) {
        RateLimiter::shutdown(self);
    }
}

impl Admission for WindowLimiter {
    fn admit(&self, key: &str) -> Result<Decision> {
        self.with_counter(key, |counter| {
            let allowed = counter.record_use();
            let remaining = i64::try_from(counter.remaining_capacity()).unwrap_or(i64::MAX);
            Decision { allowed, remaining }
        })
    }

    fn shutdown(&self) {
        WindowLimiter::shutdown(self);
    }
}
