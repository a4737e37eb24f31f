//! Token bucket counter implementation.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::registry::Counter;
use super::scheduler::{Scheduler, TickHandle};
use crate::config::{DecrementPolicy, TokenBucketConfig};
use crate::error::{LimiterError, Result};

/// Shared between the bucket and its replenishment timer.
#[derive(Debug)]
struct BucketState {
    tokens: AtomicI64,
    limit: i64,
    increment: i64,
    policy: DecrementPolicy,
}

impl BucketState {
    fn replenish(&self) {
        let refilled = self
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tokens| {
                (tokens < self.limit).then(|| tokens.saturating_add(self.increment).min(self.limit))
            });

        if let Ok(previous) = refilled {
            trace!(
                previous = previous,
                limit = self.limit,
                "Replenished token bucket"
            );
        }
    }

    /// Apply `amount` under the bucket's policy. `Ok` carries the tokens left after
    /// the decrement, `Err` the untouched balance when nothing was taken.
    fn take(&self, amount: i64) -> std::result::Result<i64, i64> {
        let applied = match self.policy {
            DecrementPolicy::Strict => {
                self.tokens
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tokens| {
                        (tokens >= amount).then(|| tokens - amount)
                    })
            }
            DecrementPolicy::Clamped => {
                self.tokens
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tokens| {
                        (tokens > 0).then(|| tokens.saturating_sub(amount))
                    })
            }
        };

        applied.map(|previous| previous.saturating_sub(amount))
    }
}

/// A bucket of tokens that refills by a fixed increment on every tick, up to its limit.
///
/// Token arithmetic is lock-free; the bucket owns one periodic timer that is cancelled
/// by [`TokenBucket::destroy`] or when the bucket is dropped.
pub struct TokenBucket {
    state: Arc<BucketState>,
    ticker: TickHandle,
    retired: AtomicBool,
}

impl TokenBucket {
    /// Create a full bucket whose replenishment is driven by `scheduler`.
    pub fn new(config: &TokenBucketConfig, scheduler: &dyn Scheduler) -> Self {
        let state = Arc::new(Self::initial_state(config));

        let weak = Arc::downgrade(&state);
        let ticker = scheduler.every(
            config.increment_interval(),
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.replenish();
                }
            }),
        );

        Self {
            state,
            ticker,
            retired: AtomicBool::new(false),
        }
    }

    /// Create a full bucket with no timer; the owner calls [`TokenBucket::replenish`].
    pub fn detached(config: &TokenBucketConfig) -> Self {
        Self {
            state: Arc::new(Self::initial_state(config)),
            ticker: TickHandle::inert(),
            retired: AtomicBool::new(false),
        }
    }

    fn initial_state(config: &TokenBucketConfig) -> BucketState {
        let limit = i64::try_from(config.limit).unwrap_or(i64::MAX);
        BucketState {
            tokens: AtomicI64::new(limit),
            limit,
            increment: i64::try_from(config.increment).unwrap_or(i64::MAX),
            policy: config.policy,
        }
    }

    /// Take `amount` tokens (an amount of 0 counts as 1) and return what is left.
    ///
    /// A strict bucket fails with [`LimiterError::InsufficientCapacity`] when it holds
    /// fewer than `amount` tokens. A clamped bucket never fails.
    pub fn consume(&self, amount: u64) -> Result<i64> {
        let requested = normalize_amount(amount);

        match self.try_consume(requested) {
            Ok(remaining) => Ok(remaining),
            Err(available) => match self.state.policy {
                DecrementPolicy::Strict => {
                    debug!(
                        requested = requested,
                        available = available,
                        "Token bucket exhausted"
                    );
                    Err(LimiterError::InsufficientCapacity {
                        requested,
                        available,
                    })
                }
                DecrementPolicy::Clamped => Ok(available),
            },
        }
    }

    /// Take a single token.
    pub fn consume_one(&self) -> Result<i64> {
        self.consume(1)
    }

    /// Like [`TokenBucket::consume`] but reports a refused decrement as `Err(balance)`
    /// regardless of policy.
    pub fn try_consume(&self, amount: u64) -> std::result::Result<i64, i64> {
        let amount = i64::try_from(normalize_amount(amount)).unwrap_or(i64::MAX);
        let taken = self.state.take(amount);
        trace!(amount = amount, outcome = ?taken, "Consumed from token bucket");
        taken
    }

    /// Tokens currently available. Negative only under the clamped policy.
    pub fn remaining(&self) -> i64 {
        self.state.tokens.load(Ordering::SeqCst)
    }

    /// Add one increment of tokens, never exceeding the limit.
    pub fn replenish(&self) {
        self.state.replenish();
    }

    /// The bucket's token ceiling.
    pub fn limit(&self) -> u64 {
        self.state.limit as u64
    }

    /// Tokens restored per tick.
    pub fn increment(&self) -> u64 {
        self.state.increment as u64
    }

    /// The decrement policy fixed at construction.
    pub fn policy(&self) -> DecrementPolicy {
        self.state.policy
    }

    /// Whether the bucket has recovered all of its tokens.
    pub fn is_full(&self) -> bool {
        self.remaining() >= self.state.limit
    }

    /// Stop replenishment. Safe to call any number of times.
    pub fn destroy(&self) {
        self.ticker.cancel();
        if !self.retired.swap(true, Ordering::SeqCst) {
            trace!(remaining = self.remaining(), "Token bucket retired");
        }
    }

    /// Whether [`TokenBucket::destroy`] has been called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

impl Counter for TokenBucket {
    fn retire(&self) {
        self.destroy();
    }

    fn is_idle(&self) -> bool {
        self.is_full()
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("tokens", &self.remaining())
            .field("limit", &self.state.limit)
            .field("increment", &self.state.increment)
            .field("policy", &self.state.policy)
            .field("retired", &self.is_retired())
            .finish()
    }
}

fn normalize_amount(amount: u64) -> u64 {
    if amount == 0 {
        1
    } else {
        amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::scheduler::TokioScheduler;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn config(limit: u64, increment: u64, interval_ms: u64, policy: DecrementPolicy) -> TokenBucketConfig {
        TokenBucketConfig {
            limit,
            increment,
            increment_interval_ms: interval_ms,
            policy,
            ..TokenBucketConfig::default()
        }
    }

    #[test]
    fn test_starts_full() {
        let bucket = TokenBucket::detached(&TokenBucketConfig::default());
        assert_eq!(bucket.remaining(), 25);
        assert_eq!(bucket.limit(), 25);
        assert_eq!(bucket.increment(), 1);
        assert!(bucket.is_full());
    }

    #[test]
    fn test_consume_default_and_amount() {
        let bucket = TokenBucket::detached(&TokenBucketConfig::default());

        assert_eq!(bucket.consume_one().unwrap(), 24);
        assert_eq!(bucket.consume(5).unwrap(), 19);
        // Zero means one, as an omitted amount does.
        assert_eq!(bucket.consume(0).unwrap(), 18);
    }

    #[test]
    fn test_strict_exact_depletion_then_failure() {
        let bucket = TokenBucket::detached(&config(20, 2, 5000, DecrementPolicy::Strict));

        for expected in (0..20).rev() {
            assert_eq!(bucket.consume_one().unwrap(), expected);
        }

        let err = bucket.consume_one().unwrap_err();
        assert!(matches!(
            err,
            LimiterError::InsufficientCapacity {
                requested: 1,
                available: 0
            }
        ));
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn test_strict_rejects_oversized_request_without_change() {
        let bucket = TokenBucket::detached(&config(10, 1, 5000, DecrementPolicy::Strict));
        bucket.consume(7).unwrap();

        assert!(bucket.consume(4).is_err());
        assert_eq!(bucket.remaining(), 3);
        assert_eq!(bucket.consume(3).unwrap(), 0);
    }

    #[test]
    fn test_clamped_goes_negative_once() {
        let bucket = TokenBucket::detached(&config(25, 1, 500, DecrementPolicy::Clamped));

        assert_eq!(bucket.consume(30).unwrap(), -5);
        assert_eq!(bucket.remaining(), -5);

        // An empty bucket is left alone.
        assert_eq!(bucket.consume(1).unwrap(), -5);
        assert_eq!(bucket.try_consume(1), Err(-5));
        assert_eq!(bucket.remaining(), -5);
    }

    #[test]
    fn test_clamped_recovers_to_limit() {
        let bucket = TokenBucket::detached(&config(25, 1, 500, DecrementPolicy::Clamped));
        bucket.consume(30).unwrap();

        for _ in 0..5 {
            bucket.replenish();
        }
        assert_eq!(bucket.remaining(), 0);

        for _ in 0..100 {
            bucket.replenish();
        }
        assert_eq!(bucket.remaining(), 25);
    }

    #[test]
    fn test_replenish_clamps_at_limit() {
        let bucket = TokenBucket::detached(&config(10, 4, 5000, DecrementPolicy::Strict));
        bucket.consume(2).unwrap();

        bucket.replenish();
        assert_eq!(bucket.remaining(), 10);

        for _ in 0..50 {
            bucket.replenish();
        }
        assert_eq!(bucket.remaining(), 10);
    }

    #[test]
    fn test_strict_invariant_holds_over_mixed_sequence() {
        let bucket = TokenBucket::detached(&config(7, 3, 5000, DecrementPolicy::Strict));

        for step in 0..200u64 {
            if step % 3 == 0 {
                bucket.replenish();
            } else {
                let _ = bucket.consume(step % 5);
            }
            let remaining = bucket.remaining();
            assert!((0..=7).contains(&remaining), "step {} left {}", step, remaining);
        }
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let bucket = TokenBucket::detached(&TokenBucketConfig::default());
        assert!(!bucket.is_retired());

        bucket.destroy();
        bucket.destroy();
        bucket.destroy();
        assert!(bucket.is_retired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_scenario_refills_on_tick() {
        let scheduler = TokioScheduler::current().unwrap();
        let bucket = TokenBucket::new(&config(20, 2, 5000, DecrementPolicy::Strict), &scheduler);

        bucket.consume(20).unwrap();
        assert_eq!(bucket.remaining(), 0);
        assert!(bucket.consume_one().is_err());

        tokio::time::advance(Duration::from_millis(4999)).await;
        settle().await;
        assert_eq!(bucket.remaining(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(bucket.remaining(), 2);

        bucket.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_bucket_never_exceeds_limit() {
        let scheduler = TokioScheduler::current().unwrap();
        let bucket = TokenBucket::new(&config(5, 3, 100, DecrementPolicy::Strict), &scheduler);
        bucket.consume(1).unwrap();

        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(bucket.remaining(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_replenishment() {
        let scheduler = TokioScheduler::current().unwrap();
        let bucket = TokenBucket::new(&config(10, 1, 500, DecrementPolicy::Strict), &scheduler);
        bucket.consume(4).unwrap();

        bucket.destroy();
        bucket.destroy();

        tokio::time::advance(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(bucket.remaining(), 6);
        assert!(bucket.is_retired());
    }
}
