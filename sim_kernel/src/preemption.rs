//! Preemption notifications
//!
//! When a real-time slice runs out, or a strict periodic thread overruns its
//! deadline, the thread is queued on the sender list of its preemption
//! receiver. A thread has at most one notification outstanding.

use crate::KernelState;
use core_types::{ThreadId, ThreadKey};
use kernel_api::{Instant, SliceId};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptionKind {
    SliceExpired,
    DeadlineMissed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionNotice {
    pub thread: ThreadId,
    pub slice: SliceId,
    pub time: Instant,
    pub kind: PreemptionKind,
}

/// Sender lists, keyed by receiver
#[derive(Debug, Clone, Default)]
pub struct PreemptionQueues {
    senders: BTreeMap<ThreadKey, VecDeque<PreemptionNotice>>,
}

impl PreemptionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, receiver: ThreadKey, notice: PreemptionNotice) {
        self.senders.entry(receiver).or_default().push_back(notice);
    }

    /// Removes the notification of `sender` from every list
    pub fn cancel(&mut self, sender: ThreadKey) -> bool {
        let mut removed = false;
        for queue in self.senders.values_mut() {
            let before = queue.len();
            queue.retain(|n| n.thread.key() != sender);
            removed |= queue.len() != before;
        }
        self.senders.retain(|_, queue| !queue.is_empty());
        removed
    }

    /// Drops the sender list of a receiver that went away
    pub fn remove_receiver(&mut self, receiver: ThreadKey) -> Vec<PreemptionNotice> {
        self.senders
            .remove(&receiver)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, receiver: ThreadKey) -> Vec<PreemptionNotice> {
        self.senders
            .get(&receiver)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn take(&mut self, receiver: ThreadKey) -> Option<PreemptionNotice> {
        let queue = self.senders.get_mut(&receiver)?;
        let notice = queue.pop_front();
        if queue.is_empty() {
            self.senders.remove(&receiver);
        }
        notice
    }

    pub fn len(&self) -> usize {
        self.senders.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl KernelState {
    /// Queues `thread` on its preemption receiver, if it has a live one
    pub(crate) fn post_preemption(&mut self, thread: ThreadKey, slice: SliceId, kind: PreemptionKind) {
        let now = self.clock.now();
        let Some(t) = self.threads.get(&thread) else {
            return;
        };
        if t.preemption_pending() {
            return;
        }
        let Some(receiver) = t.preemption_receiver().map(|r| r.key()) else {
            return;
        };
        if !self.threads.contains_key(&receiver) {
            return;
        }

        let notice = PreemptionNotice {
            thread: t.id(),
            slice,
            time: now,
            kind,
        };
        trace!("preemption {:?} of {} posted to {}", kind, thread, receiver);
        self.preemptions.post(receiver, notice);
        if let Some(t) = self.threads.get_mut(&thread) {
            t.set_preemption_pending(true);
        }
    }

    /// Withdraws an outstanding notification of `thread`
    pub(crate) fn cancel_preemption(&mut self, thread: ThreadKey) {
        self.preemptions.cancel(thread);
        if let Some(t) = self.threads.get_mut(&thread) {
            t.set_preemption_pending(false);
        }
    }

    /// Delivers the oldest notification queued on `receiver`
    pub(crate) fn take_preemption(&mut self, receiver: ThreadKey) -> Option<PreemptionNotice> {
        let notice = self.preemptions.take(receiver)?;
        if let Some(t) = self.threads.get_mut(&notice.thread.key()) {
            t.set_preemption_pending(false);
        }
        Some(notice)
    }
}
