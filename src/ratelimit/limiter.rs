//! Per-key rate limiters built on the counter registry.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::registry::{Counter, Registry};
use super::scheduler::{Scheduler, TickHandle, TokioScheduler};
use super::token_bucket::TokenBucket;
use super::window::WindowCounter;
use crate::config::{TokenBucketConfig, WindowConfig};
use crate::error::Result;

/// Shortest pause between window sweeps; zero-length windows are idle at once.
const MIN_WINDOW_SWEEP: Duration = Duration::from_secs(1);

/// Periodic eviction of idle counters from a registry.
///
/// Stopping the sweep is not final: the next call that touches the registry arms
/// it again.
struct IdleSweep {
    scheduler: Option<Arc<dyn Scheduler>>,
    period: Duration,
    handle: Mutex<TickHandle>,
    armed: AtomicBool,
}

impl IdleSweep {
    fn disabled() -> Self {
        Self {
            scheduler: None,
            period: Duration::ZERO,
            handle: Mutex::new(TickHandle::inert()),
            armed: AtomicBool::new(false),
        }
    }

    fn start<C: Counter>(
        scheduler: Arc<dyn Scheduler>,
        period: Duration,
        registry: &Arc<Registry<C>>,
    ) -> Self {
        let sweep = Self {
            scheduler: Some(scheduler),
            period,
            ..Self::disabled()
        };
        sweep.ensure(registry);
        sweep
    }

    /// Arm the sweep unless it is disabled or already running.
    fn ensure<C: Counter>(&self, registry: &Arc<Registry<C>>) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if self.armed.load(Ordering::Acquire) {
            return;
        }

        let mut handle = self.handle.lock();
        if self.armed.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(registry);
        *handle = scheduler.every(
            self.period,
            Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.evict_idle();
                }
            }),
        );
        self.armed.store(true, Ordering::Release);
        trace!(period_ms = self.period.as_millis() as u64, "Idle sweep armed");
    }

    /// Cancel the sweep. Returns whether it was running.
    fn stop(&self) -> bool {
        let handle = self.handle.lock();
        handle.cancel();
        self.armed.swap(false, Ordering::AcqRel)
    }
}

/// A token bucket per key, with periodic eviction of fully recovered buckets.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Token buckets indexed by key
    registry: Arc<Registry<TokenBucket>>,
    config: TokenBucketConfig,
    sweep: IdleSweep,
}

impl RateLimiter {
    /// Create a rate limiter on the current Tokio runtime.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        let scheduler = TokioScheduler::current()?;
        Self::with_scheduler(config, Arc::new(scheduler))
    }

    /// Create a rate limiter whose timers run on `scheduler`.
    pub fn with_scheduler(config: TokenBucketConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;

        let bucket_config = config.clone();
        let bucket_scheduler = scheduler.clone();
        let registry = Arc::new(Registry::new(move |_key| {
            TokenBucket::new(&bucket_config, bucket_scheduler.as_ref())
        }));

        let sweep = if config.evict_idle {
            IdleSweep::start(scheduler, config.eviction_interval(), &registry)
        } else {
            IdleSweep::disabled()
        };

        info!(
            limit = config.limit,
            increment = config.increment,
            interval_ms = config.increment_interval_ms,
            policy = ?config.policy,
            evict_idle = config.evict_idle,
            "Token bucket rate limiter started"
        );

        Ok(Self {
            registry,
            config,
            sweep,
        })
    }

    /// Take `amount` tokens from `key`'s bucket (0 counts as 1) and return what is left.
    pub fn consume(&self, key: &str, amount: u64) -> Result<i64> {
        trace!(key = %key, amount = amount, "Consuming tokens");
        self.with_bucket(key, |bucket| bucket.consume(amount))?
    }

    /// Tokens available to `key`, creating its bucket if unseen.
    pub fn remaining(&self, key: &str) -> Result<i64> {
        self.with_bucket(key, TokenBucket::remaining)
    }

    /// The bucket for `key`, creating it if unseen.
    ///
    /// The handle is a snapshot: once the bucket recovers, a sweep may evict it and
    /// later calls for `key` get a fresh bucket.
    pub fn bucket(&self, key: &str) -> Result<Arc<TokenBucket>> {
        self.sweep.ensure(&self.registry);
        self.registry.get_or_create(key)
    }

    /// Run `f` on `key`'s bucket while the sweep is held off that entry.
    pub(super) fn with_bucket<T>(&self, key: &str, f: impl FnOnce(&TokenBucket) -> T) -> Result<T> {
        self.sweep.ensure(&self.registry);
        self.registry.with(key, f)
    }

    /// Run one eviction sweep now. Returns how many buckets were dropped.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle()
    }

    /// Stop every timer and drop all per-key state. Safe to call more than once.
    ///
    /// The limiter remains usable; the next call recreates state and restarts the
    /// eviction sweep.
    pub fn shutdown(&self) {
        let was_sweeping = self.sweep.stop();
        if !was_sweeping && self.registry.is_empty() {
            return;
        }
        let released = self.registry.len();
        self.registry.destroy_all();
        info!(released = released, "Token bucket rate limiter shut down");
    }

    /// Get the number of active buckets.
    pub fn counter_count(&self) -> usize {
        self.registry.len()
    }

    /// The configuration every bucket is built from.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.sweep.stop();
        self.registry.destroy_all();
    }
}

/// A windowed counter per key.
///
/// Built with a scheduler, counters whose window has lapsed are swept away
/// periodically; without one, the map keeps every key it has seen until
/// [`WindowLimiter::shutdown`] or [`WindowLimiter::evict_idle`].
pub struct WindowLimiter {
    registry: Arc<Registry<WindowCounter>>,
    config: WindowConfig,
    sweep: IdleSweep,
}

impl WindowLimiter {
    /// Create a windowed limiter. No runtime is required.
    pub fn new(config: WindowConfig) -> Self {
        let registry = Self::registry(&config);
        debug!(
            limit = config.limit,
            period_ms = config.period_ms,
            "Window rate limiter started"
        );
        Self {
            registry,
            config,
            sweep: IdleSweep::disabled(),
        }
    }

    /// Create a windowed limiter that sweeps lapsed counters on `scheduler`, once
    /// per window (at least every second).
    pub fn with_scheduler(config: WindowConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let registry = Self::registry(&config);
        let period = config.period().max(MIN_WINDOW_SWEEP);
        let sweep = IdleSweep::start(scheduler, period, &registry);
        debug!(
            limit = config.limit,
            period_ms = config.period_ms,
            sweep_ms = period.as_millis() as u64,
            "Window rate limiter started"
        );
        Self {
            registry,
            config,
            sweep,
        }
    }

    fn registry(config: &WindowConfig) -> Arc<Registry<WindowCounter>> {
        let counter_config = config.clone();
        Arc::new(Registry::new(move |_key| {
            WindowCounter::from_config(&counter_config)
        }))
    }

    /// Record a use for `key` and report whether it fits in the current window.
    pub fn check_eligible(&self, key: &str) -> Result<bool> {
        let eligible = self.with_counter(key, WindowCounter::record_use)?;
        if !eligible {
            debug!(key = %key, limit = self.config.limit, "Rate limit exceeded");
        }
        Ok(eligible)
    }

    /// Time left in `key`'s current window.
    pub fn remaining_in_window(&self, key: &str) -> Result<Duration> {
        self.with_counter(key, WindowCounter::remaining_in_window)
    }

    /// Uses still admitted in `key`'s current window.
    pub fn remaining(&self, key: &str) -> Result<u64> {
        self.with_counter(key, WindowCounter::remaining_capacity)
    }

    /// The counter for `key`, creating it if unseen.
    pub fn counter(&self, key: &str) -> Result<Arc<WindowCounter>> {
        self.sweep.ensure(&self.registry);
        self.registry.get_or_create(key)
    }

    /// Run `f` on `key`'s counter while the sweep is held off that entry.
    pub(super) fn with_counter<T>(
        &self,
        key: &str,
        f: impl FnOnce(&WindowCounter) -> T,
    ) -> Result<T> {
        self.sweep.ensure(&self.registry);
        self.registry.with(key, f)
    }

    /// Drop every counter whose window has lapsed. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle()
    }

    /// Stop the sweep and drop all per-key state. Safe to call more than once.
    pub fn shutdown(&self) {
        self.sweep.stop();
        self.registry.destroy_all();
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.registry.len()
    }

    /// The configuration every counter is built from.
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }
}
