//! # Simulated Clock and Deadline Timeouts
//!
//! Deterministic time for the simulated kernel.
//!
//! ## Philosophy
//!
//! **Determinism enables thorough testing.**
//!
//! The clock only advances when told to. Deadline timeouts are single-shot:
//! arming a thread's timeout replaces the previous one, and an expired
//! timeout is gone until the expiry handler re-arms it.

use core_types::ThreadKey;
use kernel_api::{Duration, Instant};
use std::collections::{BTreeMap, BTreeSet};

/// Simulated kernel clock
///
/// # Examples
///
/// ```
/// use sim_kernel::timer::SimClock;
/// use kernel_api::Duration;
///
/// let mut clock = SimClock::new();
/// clock.advance(Duration::from_micros(100));
/// assert_eq!(clock.now().as_micros(), 100);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Instant,
}

impl SimClock {
    /// Creates a clock at boot time
    pub fn new() -> Self {
        Self {
            now: Instant::BOOT,
        }
    }

    /// Creates a clock starting at a specific instant
    pub fn starting_at(now: Instant) -> Self {
        Self { now }
    }

    /// Advances the clock; saturates at the end of time
    pub fn advance(&mut self, delta: Duration) {
        self.now = self.now + delta;
    }

    /// Moves the clock forward to `target`
    ///
    /// Targets in the past leave the clock where it is.
    pub fn advance_to(&mut self, target: Instant) {
        if target > self.now {
            self.now = target;
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }
}

/// Armed deadline timeouts, one per thread at most
#[derive(Debug, Clone, Default)]
pub struct TimeoutQueue {
    armed: BTreeSet<(Instant, ThreadKey)>,
    by_thread: BTreeMap<ThreadKey, Instant>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timeout of `thread`, replacing an earlier one
    pub fn arm(&mut self, thread: ThreadKey, at: Instant) {
        self.cancel(thread);
        self.armed.insert((at, thread));
        self.by_thread.insert(thread, at);
    }

    /// Disarms the timeout of `thread`, returning when it would have fired
    pub fn cancel(&mut self, thread: ThreadKey) -> Option<Instant> {
        let at = self.by_thread.remove(&thread)?;
        self.armed.remove(&(at, thread));
        Some(at)
    }

    pub fn is_armed(&self, thread: ThreadKey) -> bool {
        self.by_thread.contains_key(&thread)
    }

    pub fn deadline_of(&self, thread: ThreadKey) -> Option<Instant> {
        self.by_thread.get(&thread).copied()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.iter().next().map(|(at, _)| *at)
    }

    /// Removes and returns the earliest timeout due at or before `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<(Instant, ThreadKey)> {
        let first = *self.armed.iter().next()?;
        if first.0 > now {
            return None;
        }
        self.armed.remove(&first);
        self.by_thread.remove(&first.1);
        Some(first)
    }

    pub fn len(&self) -> usize {
        self.by_thread.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_thread.is_empty()
    }
}
