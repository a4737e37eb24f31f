//! Single-call admission decisions for inbound requests.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::extractor::{KeyExtractor, PathExtractor};
use crate::config::{Algorithm, KeylimitConfig};
use crate::error::Result;
use crate::ratelimit::{Admission, Decision, LimitKey, RateLimiter, TokioScheduler, WindowLimiter};

/// The decision for one request, together with the key it was charged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Key the request was charged to
    pub key: LimitKey,
    /// Admission outcome, serialized inline next to the key
    #[serde(flatten)]
    pub decision: Decision,
}

/// Combines a key extractor with a limiter to answer "is this request allowed".
pub struct Gate<B: Admission + ?Sized, E> {
    /// The limiter instance
    backend: Arc<B>,
    extractor: E,
}

impl<B: Admission + ?Sized, E> Gate<B, E> {
    /// Create a gate over the given limiter.
    pub fn new(backend: Arc<B>, extractor: E) -> Self {
        Self { backend, extractor }
    }

    /// Extract the key from `request` and account one unit of work against it.
    #[instrument(skip_all)]
    pub fn check<R: ?Sized>(&self, request: &R) -> Result<Verdict>
    where
        E: KeyExtractor<R>,
    {
        let key = self.extractor.extract(request)?;
        let decision = self.backend.admit(key.as_str())?;

        if !decision.allowed {
            debug!(key = %key, remaining = decision.remaining, "Request throttled");
        }

        Ok(Verdict { key, decision })
    }

    /// The limiter behind this gate.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Stop the limiter and release all per-key state.
    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}

impl Gate<dyn Admission, PathExtractor> {
    /// Build a gate for JSON request records from configuration.
    ///
    /// The token bucket algorithm needs a Tokio runtime to drive replenishment. The
    /// window algorithm uses one, when present, to sweep lapsed counters.
    pub fn from_config(config: &KeylimitConfig) -> Result<Self> {
        config.validate()?;
        let extractor = PathExtractor::new(&config.facade.key)?;

        let backend: Arc<dyn Admission> = match config.facade.algorithm {
            Algorithm::TokenBucket => Arc::new(RateLimiter::new(config.token_bucket.clone())?),
            Algorithm::Window => match TokioScheduler::current() {
                Ok(scheduler) => Arc::new(WindowLimiter::with_scheduler(
                    config.window.clone(),
                    Arc::new(scheduler),
                )),
                Err(_) => {
                    debug!("No runtime available, window counters will not be swept");
                    Arc::new(WindowLimiter::new(config.window.clone()))
                }
            },
        };

        info!(
            key = %extractor.path(),
            algorithm = ?config.facade.algorithm,
            "Request gate ready"
        );

        Ok(Self::new(backend, extractor))
    }
}
