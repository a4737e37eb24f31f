//! Periodic timers that drive replenishment and eviction.
//!
//! Every counter that refills over time owns one [`TickHandle`]. Cancelling the
//! handle (or dropping it) stops the timer; a tick that is already running is
//! allowed to finish against whatever state it still holds.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::error::{LimiterError, Result};

/// Work run on every tick.
pub type TickFn = Box<dyn Fn() + Send + Sync + 'static>;

/// Something that can run a callback on a fixed period.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `tick` every `period`, starting one period from now.
    fn every(&self, period: Duration, tick: TickFn) -> TickHandle;
}

/// Cancellation handle for a periodic task.
///
/// Cancelling is idempotent and the task is cancelled on drop.
pub struct TickHandle {
    task: Mutex<Option<AbortHandle>>,
}

impl TickHandle {
    fn new(task: AbortHandle) -> Self {
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// A handle with no task behind it.
    pub fn inert() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Stop the periodic task.
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Whether the task has been cancelled (or never existed).
    pub fn is_cancelled(&self) -> bool {
        self.task.lock().is_none()
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduler backed by a Tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Use the given runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| LimiterError::Scheduler(e.to_string()))
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, period: Duration, tick: TickFn) -> TickHandle {
        if period.is_zero() {
            warn!("Refusing to schedule a timer with a zero period");
            return TickHandle::inert();
        }

        let start = Instant::now() + period;
        let join = self.handle.spawn(async move {
            let mut interval = interval_at(start, period);
            // Missed ticks are replayed so refill keeps pace with elapsed time.
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                trace!(period_ms = period.as_millis() as u64, "Timer tick");
                tick();
            }
        });
        TickHandle::new(join.abort_handle())
    }
}
