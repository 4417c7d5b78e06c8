//! Priority Scheduler with a Global Timeslice
//!
//! ## Philosophy
//!
//! - **Determinism first**: Same inputs + same clock => same schedule.
//! - **No hidden yields**: Every switch is a schedule pass on an explicit event.
//! - **Strict priorities**: The highest-priority READY thread runs. Threads of
//!   equal priority share the CPU round robin.
//!
//! ## Design
//!
//! - **Ready lists**: One FIFO per priority. A thread is queued at the priority
//!   of its *active* timeslice, and on at most one list.
//! - **Global timeslice**: The kernel tracks which thread's slice is being
//!   consumed and how much of it is left. A schedule pass saves the remainder
//!   (or refills an expired slice), advances an expired real-time slice to its
//!   ring successor, and rotates the round robin on an expired home slice.
//! - **Running threads stay queued**: The current thread is the front of its
//!   list until it blocks or its slice runs out.

use crate::preemption::PreemptionKind;
use crate::KernelState;
use core_types::{ThreadId, ThreadKey};
use kernel_api::{Duration, KernelError, Prio, SliceId, ThreadSwitchReply};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Scheduling event for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// Thread was selected to run
    ThreadSelected {
        thread: ThreadKey,
        slice: SliceId,
        timestamp_micros: u64,
    },
    /// The global timeslice ran out
    SliceExpired {
        thread: ThreadKey,
        slice: SliceId,
        timestamp_micros: u64,
    },
    /// `thread_switch` handed the CPU to a ready thread directly
    DirectSwitch {
        from: ThreadKey,
        to: ThreadKey,
        timestamp_micros: u64,
    },
    /// A strict periodic thread was still inside its real-time slices
    DeadlineMissed {
        thread: ThreadKey,
        deadline_micros: u64,
        timestamp_micros: u64,
    },
}

/// Run queues for ready threads
///
/// Ordering within a priority is FIFO.
#[derive(Debug, Default)]
pub struct ReadyQueues {
    lists: BTreeMap<Prio, VecDeque<ThreadKey>>,
    enqueued: HashMap<ThreadKey, Prio>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `thread` at the back of `prio`; no-op if already queued
    pub fn enqueue(&mut self, thread: ThreadKey, prio: Prio) {
        if self.enqueued.contains_key(&thread) {
            return;
        }
        self.lists.entry(prio).or_default().push_back(thread);
        self.enqueued.insert(thread, prio);
    }

    pub fn dequeue(&mut self, thread: ThreadKey) -> bool {
        let Some(prio) = self.enqueued.remove(&thread) else {
            return false;
        };
        if let Some(list) = self.lists.get_mut(&prio) {
            list.retain(|&t| t != thread);
            if list.is_empty() {
                self.lists.remove(&prio);
            }
        }
        true
    }

    /// Moves `thread` behind its peers of equal priority
    pub fn rotate(&mut self, thread: ThreadKey) {
        if let Some(&prio) = self.enqueued.get(&thread) {
            if let Some(list) = self.lists.get_mut(&prio) {
                list.retain(|&t| t != thread);
                list.push_back(thread);
            }
        }
    }

    pub fn is_enqueued(&self, thread: ThreadKey) -> bool {
        self.enqueued.contains_key(&thread)
    }

    pub fn enqueued_prio(&self, thread: ThreadKey) -> Option<Prio> {
        self.enqueued.get(&thread).copied()
    }

    /// Front of the highest non-empty list
    pub fn highest(&self) -> Option<ThreadKey> {
        self.lists
            .iter()
            .next_back()
            .and_then(|(_, list)| list.front().copied())
    }

    /// Threads queued at `prio`, front first
    pub fn at_prio(&self, prio: Prio) -> Vec<ThreadKey> {
        self.lists
            .get(&prio)
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.enqueued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty()
    }
}

/// Scheduler state
#[derive(Debug, Default)]
pub struct Scheduler {
    pub(crate) ready: ReadyQueues,
    current: Option<ThreadKey>,
    /// Owner and id of the slice being consumed
    current_slice: Option<(ThreadKey, SliceId)>,
    timeslice_left: Duration,
    /// Audit log for scheduling events (test-only)
    audit_log: Vec<ScheduleEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread that owns the CPU
    pub fn current(&self) -> Option<ThreadKey> {
        self.current
    }

    /// Owner and id of the global timeslice
    pub fn current_slice(&self) -> Option<(ThreadKey, SliceId)> {
        self.current_slice
    }

    pub fn timeslice_left(&self) -> Duration {
        self.timeslice_left
    }

    pub fn ready(&self) -> &ReadyQueues {
        &self.ready
    }

    /// Returns a reference to the audit log
    ///
    /// Used in tests to verify scheduling behavior.
    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }

    pub(crate) fn record(&mut self, event: ScheduleEvent) {
        self.audit_log.push(event);
    }

    /// Forgets the global timeslice; the next pass loads a fresh one
    pub(crate) fn invalidate_slice(&mut self) {
        self.current_slice = None;
        self.timeslice_left = Duration::ZERO;
    }

    /// Forgets everything about a thread that is being deleted
    pub(crate) fn forget(&mut self, thread: ThreadKey) {
        self.ready.dequeue(thread);
        if self.current == Some(thread) {
            self.current = None;
        }
        if matches!(self.current_slice, Some((owner, _)) if owner == thread) {
            self.invalidate_slice();
        }
    }
}

impl KernelState {
    /// Queues a READY thread at the priority of its active slice
    pub(crate) fn ready_enqueue(&mut self, key: ThreadKey) {
        if let Some(thread) = self.threads.get(&key) {
            if thread.is_ready() {
                let prio = thread.sched().prio();
                self.scheduler.ready.enqueue(key, prio);
            }
        }
    }

    pub(crate) fn ready_dequeue(&mut self, key: ThreadKey) {
        self.scheduler.ready.dequeue(key);
    }

    /// Brings the ready lists in line with the thread's state and priority
    pub(crate) fn sync_ready(&mut self, key: ThreadKey) {
        let wanted = self
            .threads
            .get(&key)
            .filter(|t| t.is_ready())
            .map(|t| t.sched().prio());

        match (wanted, self.scheduler.ready.enqueued_prio(key)) {
            (Some(prio), Some(queued)) if prio == queued => {}
            (Some(prio), _) => {
                self.scheduler.ready.dequeue(key);
                self.scheduler.ready.enqueue(key, prio);
            }
            (None, Some(_)) => {
                self.scheduler.ready.dequeue(key);
            }
            (None, None) => {}
        }
    }

    /// Moves `key` onto the slice at ring position `index`
    ///
    /// The slice being left is refilled and, if it was the global timeslice,
    /// invalidated. The thread goes to the back of its new priority list.
    pub(crate) fn switch_sched(&mut self, key: ThreadKey, index: usize) {
        let Some(thread) = self.threads.get_mut(&key) else {
            return;
        };

        let leaving = thread.sched().id();
        if self.scheduler.current_slice == Some((key, leaving)) {
            self.scheduler.invalidate_slice();
        }
        thread.ring_mut().active_mut().replenish();

        self.scheduler.ready.dequeue(key);
        if let Some(thread) = self.threads.get_mut(&key) {
            thread.ring_mut().set_active(index);
            thread.ring_mut().active_mut().replenish();
        }
        self.ready_enqueue(key);
    }

    /// Saves the global timeslice and selects the next thread to run
    pub(crate) fn schedule(&mut self) {
        let now = self.clock.now().as_micros();

        if let Some((owner, slice_id)) = self.scheduler.current_slice {
            let left = self.scheduler.timeslice_left;

            // A zero quantum runs until the thread blocks or yields
            let saved = self.threads.get_mut(&owner).and_then(|thread| {
                let position = thread.ring().position(slice_id)?;
                let slice = thread.ring_mut().get_mut(slice_id)?;
                let expired = left.is_zero() && !slice.quantum().is_zero();
                if expired {
                    slice.replenish();
                } else {
                    slice.set_left(left);
                }
                Some((position, slice.is_home(), expired))
            });

            if let Some((position, home, true)) = saved {
                self.scheduler.record(ScheduleEvent::SliceExpired {
                    thread: owner,
                    slice: slice_id,
                    timestamp_micros: now,
                });

                if !home {
                    self.post_preemption(owner, slice_id, PreemptionKind::SliceExpired);
                    self.scheduler.ready.dequeue(owner);
                    if let Some(thread) = self.threads.get_mut(&owner) {
                        let next = thread.ring().next_index(position);
                        thread.ring_mut().set_active(next);
                    }
                    self.ready_enqueue(owner);
                } else {
                    self.scheduler.ready.rotate(owner);
                }
            }
        }

        let next = self.scheduler.ready.highest().and_then(|key| {
            self.threads
                .get(&key)
                .map(|t| (key, t.sched().id(), t.sched().left()))
        });

        match next {
            Some((key, slice, left)) => {
                if self.scheduler.current != Some(key)
                    || self.scheduler.current_slice != Some((key, slice))
                {
                    trace!("schedule: {} on slice {}", key, slice);
                    self.scheduler.record(ScheduleEvent::ThreadSelected {
                        thread: key,
                        slice,
                        timestamp_micros: now,
                    });
                }
                self.scheduler.current = Some(key);
                self.scheduler.current_slice = Some((key, slice));
                self.scheduler.timeslice_left = left;
            }
            None => {
                trace!("schedule: idle");
                self.scheduler.current = None;
                self.scheduler.invalidate_slice();
            }
        }
    }

    /// Voluntary yield, optionally donating the CPU to `dest`
    pub(crate) fn thread_switch(
        &mut self,
        caller: ThreadId,
        dest: ThreadId,
    ) -> Result<ThreadSwitchReply, KernelError> {
        let me = self.live_thread(caller)?.key();

        if dest.is_nil() {
            let (left, target) = {
                let Some(thread) = self.threads.get(&me) else {
                    return Err(KernelError::InvalidCaller(caller));
                };
                let active = thread.sched();
                let left = if self.scheduler.current_slice == Some((me, active.id())) {
                    self.scheduler.timeslice_left
                } else {
                    active.left()
                };
                let index = thread.ring().active_index();
                let target = if active.is_home() {
                    index
                } else {
                    thread.ring().next_index(index)
                };
                (left, target)
            };

            self.switch_sched(me, target);
            self.schedule();
            return Ok(ThreadSwitchReply { left });
        }

        let direct = self
            .lookup(dest)
            .filter(|t| t.key() != me && t.is_ready())
            .map(|t| t.key());
        if let Some(to) = direct {
            self.scheduler.record(ScheduleEvent::DirectSwitch {
                from: me,
                to,
                timestamp_micros: self.clock.now().as_micros(),
            });
            self.scheduler.current = Some(to);
            return Ok(ThreadSwitchReply {
                left: Duration::ZERO,
            });
        }

        let left = self.scheduler.timeslice_left;
        if let Some((owner, slice_id)) = self.scheduler.current_slice {
            let target = self.threads.get(&owner).and_then(|t| {
                let position = t.ring().position(slice_id)?;
                Some(if slice_id == 0 {
                    position
                } else {
                    t.ring().next_index(position)
                })
            });
            if let Some(target) = target {
                self.switch_sched(owner, target);
            }
        }
        self.schedule();
        Ok(ThreadSwitchReply { left })
    }

    /// Advances the clock, charging the running thread and firing deadlines
    pub(crate) fn advance_time(&mut self, delta: Duration) {
        let mut remaining = delta;

        loop {
            let now = self.clock.now();
            let mut fired = false;
            while let Some((at, key)) = self.timeouts.pop_expired(now) {
                self.deadline_expired(key, at);
                fired = true;
            }
            if fired {
                self.schedule();
            }

            if remaining.is_zero() {
                break;
            }

            let mut step = remaining;
            if let Some(deadline) = self.timeouts.next_deadline() {
                step = step.min(deadline.duration_since(now));
            }
            let slice_running =
                self.scheduler.current_slice.is_some() && !self.scheduler.timeslice_left.is_zero();
            if slice_running {
                step = step.min(self.scheduler.timeslice_left);
            }

            if let Some(current) = self.scheduler.current {
                if let Some(thread) = self.threads.get_mut(&current) {
                    thread.account(step);
                }
            }
            if slice_running {
                self.scheduler.timeslice_left = self.scheduler.timeslice_left - step;
            }
            self.clock.advance(step);
            remaining = remaining - step;

            if slice_running && self.scheduler.timeslice_left.is_zero() {
                self.schedule();
            }
        }
    }
}
