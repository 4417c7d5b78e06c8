//! Transferable thread locks
//!
//! Changing another thread's scheduling or register state requires owning
//! that thread's lock. The owner is recorded in the thread itself, so the
//! lock survives being handed out of a syscall. Acquisition never spins on
//! the holder: a lock held by someone else fails with `LockContended`.

use crate::{KernelState, SimulatedKernel};
use core_types::{ThreadId, ThreadKey};
use kernel_api::{KernelError, ThreadLock};
use log::trace;
use uuid::Uuid;

/// Record of one lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTicket {
    pub target: ThreadId,
    pub owner: ThreadId,
    /// Incarnation of the target's task at acquisition time
    pub incarnation: Uuid,
    /// False for a nested acquisition by the current owner
    pub acquired: bool,
}

/// Owned thread lock
///
/// Dropping the guard releases the lock and re-enqueues the target if it is
/// ready. Nested guards release nothing.
#[must_use = "dropping the guard releases the thread lock"]
#[derive(Debug)]
pub struct ThreadLockGuard<'k> {
    kernel: &'k SimulatedKernel,
    ticket: LockTicket,
}

impl<'k> ThreadLockGuard<'k> {
    pub(crate) fn new(kernel: &'k SimulatedKernel, ticket: LockTicket) -> Self {
        Self { kernel, ticket }
    }

    pub fn ticket(&self) -> &LockTicket {
        &self.ticket
    }

    /// True if dropping this guard releases the lock
    pub fn is_outermost(&self) -> bool {
        self.ticket.acquired
    }
}

impl ThreadLock for ThreadLockGuard<'_> {
    fn target(&self) -> ThreadId {
        self.ticket.target
    }

    fn owner(&self) -> ThreadId {
        self.ticket.owner
    }
}

impl Drop for ThreadLockGuard<'_> {
    fn drop(&mut self) {
        if self.ticket.acquired {
            self.kernel.release_thread_lock(&self.ticket);
        }
    }
}

impl KernelState {
    /// Takes the lock of `target` on behalf of `owner`
    pub(crate) fn acquire_thread_lock(
        &mut self,
        owner: ThreadKey,
        target: ThreadKey,
    ) -> Result<LockTicket, KernelError> {
        let owner_id = self
            .threads
            .get(&owner)
            .map(|t| t.id())
            .ok_or(KernelError::InvalidCaller(ThreadId::from(owner)))?;
        let thread = self
            .threads
            .get_mut(&target)
            .ok_or(KernelError::NotFound(ThreadId::from(target)))?;

        let acquired = match thread.lock_owner() {
            None => {
                thread.set_lock_owner(Some(owner_id));
                trace!("{} locked by {}", target, owner);
                true
            }
            Some(holder) if holder.key() == owner => false,
            Some(holder) => {
                return Err(KernelError::LockContended {
                    target: thread.id(),
                    holder,
                })
            }
        };

        Ok(LockTicket {
            target: thread.id(),
            owner: owner_id,
            incarnation: thread.incarnation(),
            acquired,
        })
    }

    /// Clears the lock recorded in `ticket` if it still belongs to it
    pub(crate) fn release_thread_lock(&mut self, ticket: &LockTicket) {
        let key = ticket.target.key();
        if let Some(thread) = self.threads.get_mut(&key) {
            let owned = thread.incarnation() == ticket.incarnation
                && thread.lock_owner().map(|o| o.key()) == Some(ticket.owner.key());
            if owned {
                thread.set_lock_owner(None);
                trace!("{} unlocked", key);
            }
        }
        self.sync_ready(key);
        self.schedule();
    }
}

impl SimulatedKernel {
    /// Locks `target` for `owner` and wraps the lock in a guard
    pub fn lock_thread(
        &self,
        owner: ThreadId,
        target: ThreadId,
    ) -> Result<ThreadLockGuard<'_>, KernelError> {
        let ticket = self.with_cpu_lock(|s| s.acquire_thread_lock(owner.key(), target.key()))?;
        Ok(ThreadLockGuard::new(self, ticket))
    }

    pub(crate) fn release_thread_lock(&self, ticket: &LockTicket) {
        self.with_cpu_lock(|s| s.release_thread_lock(ticket));
    }
}
