//! Windowed request counter implementation.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::registry::Counter;
use crate::config::WindowConfig;

#[derive(Debug)]
struct WindowState {
    /// When the current window started
    start: Instant,
    /// Uses recorded in the current window, rejected ones included
    count: u64,
}

/// A counter that admits `limit` uses per window.
///
/// There is no timer behind it: an expired window is reset by whichever call
/// observes the expiry first.
#[derive(Debug)]
pub struct WindowCounter {
    /// The limit for this counter
    limit: u64,
    /// Length of one window
    window: Duration,
    state: Mutex<WindowState>,
}

impl WindowCounter {
    /// Create a counter whose first window starts now.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Create a counter from configuration.
    pub fn from_config(config: &WindowConfig) -> Self {
        Self::new(config.limit, config.period())
    }

    /// Time left in the current window.
    ///
    /// An expired window is reset as a side effect and the full window length is
    /// returned.
    pub fn remaining_in_window(&self) -> Duration {
        let mut state = self.state.lock();
        self.roll(&mut state)
    }

    /// Count one use and report whether it fits in the window.
    ///
    /// The use is counted even when it is rejected.
    pub fn record_use(&self) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state);

        state.count = state.count.saturating_add(1);
        let eligible = self.window.is_zero() || state.count <= self.limit;

        trace!(
            count = state.count,
            limit = self.limit,
            eligible = eligible,
            "Recorded use in window"
        );
        eligible
    }

    /// Uses recorded in the current window.
    pub fn current_count(&self) -> u64 {
        let mut state = self.state.lock();
        self.roll(&mut state);
        state.count
    }

    /// Uses still admitted in the current window.
    pub fn remaining_capacity(&self) -> u64 {
        let mut state = self.state.lock();
        self.roll(&mut state);
        self.limit.saturating_sub(state.count)
    }

    /// Get the duration until the current window resets, without resetting it.
    pub fn duration_until_reset(&self) -> Duration {
        let state = self.state.lock();
        self.window
            .saturating_sub(Instant::now().saturating_duration_since(state.start))
    }

    /// Get the limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the window length for this counter.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Reset the window if it has expired and return the time left in it.
    fn roll(&self, state: &mut WindowState) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.start);

        if elapsed >= self.window {
            state.start = now;
            state.count = 0;
            self.window
        } else {
            self.window - elapsed
        }
    }
}

impl Counter for WindowCounter {
    // Nothing is scheduled; an unused counter simply stops being consulted.
    fn retire(&self) {}

    /// A lapsed window would be reset on its next use, which is what a fresh
    /// counter starts with.
    fn is_idle(&self) -> bool {
        self.duration_until_reset().is_zero()
    }
}
