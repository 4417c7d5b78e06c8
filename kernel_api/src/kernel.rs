//! Kernel API trait and collaborator seams

use crate::syscalls::{
    ExRegsReply, ExRegsRequest, Fpage, Nearest, ScheduleReply, ScheduleVerb, TaskNewReply,
    TaskNewRequest, ThreadSwitchReply, UnmapRequest, UnmapRights, UnmapStatus,
};
use crate::{Instant, KernelError};
use core_types::{TaskNo, ThreadId};

/// Ownership of a thread's transferable lock
///
/// Dropping an implementor releases the lock. `release` makes the hand-back
/// explicit at call sites that want it.
pub trait ThreadLock {
    /// Thread the lock protects
    fn target(&self) -> ThreadId;

    /// Thread holding the lock
    fn owner(&self) -> ThreadId;

    fn release(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Mapping database collaborator behind `fpage_unmap`
///
/// The kernel only decides *what* to revoke. Walking the mapping tree is
/// entirely up to the implementation.
pub trait MappingDatabase: Send {
    /// Revokes `what` from every mapping derived from `fpage` in `space`
    ///
    /// With `self_unmap` the mapping in `space` itself is affected too.
    /// `restricted` limits revocation to mappings held by that task.
    /// Returns the REFERENCED/DIRTY bits gathered along the way.
    fn fpage_unmap(
        &mut self,
        space: TaskNo,
        fpage: Fpage,
        self_unmap: bool,
        restricted: Option<TaskNo>,
        what: UnmapRights,
    ) -> UnmapRights;
}

/// The kernel API trait
///
/// Each method is one privileged syscall issued by `caller`. The
/// implementation must authenticate `caller` itself; nothing in the request
/// is trusted.
///
/// # Example
///
/// ```ignore
/// use kernel_api::{KernelApi, ScheduleVerb};
///
/// fn demote<K: KernelApi>(kernel: &K, me: core_types::ThreadId, worker: core_types::ThreadId) {
///     let verb = ScheduleVerb::SetTimesharing { prio: 1, time: None, small_space: 0 };
///     kernel.thread_schedule(me, worker, verb, core_types::ThreadId::INVALID).unwrap();
/// }
/// ```
pub trait KernelApi {
    /// Lock guard handed out by `task_new`
    type Guard<'a>: ThreadLock
    where
        Self: 'a;

    /// Yields the CPU, optionally donating it to `dest`
    fn thread_switch(
        &self,
        caller: ThreadId,
        dest: ThreadId,
    ) -> Result<ThreadSwitchReply, KernelError>;

    /// Reads or changes scheduling parameters of `dest`
    ///
    /// `preempter` is applied only by the query and timesharing verbs; pass
    /// an invalid id to leave it alone.
    fn thread_schedule(
        &self,
        caller: ThreadId,
        dest: ThreadId,
        verb: ScheduleVerb,
        preempter: ThreadId,
    ) -> Result<ScheduleReply, KernelError>;

    /// Reads and writes registers of a thread, creating it if necessary
    fn lthread_ex_regs(
        &self,
        caller: ThreadId,
        request: ExRegsRequest,
    ) -> Result<ExRegsReply, KernelError>;

    /// Revokes access to an fpage in the caller's space
    fn fpage_unmap(
        &self,
        caller: ThreadId,
        request: UnmapRequest,
    ) -> Result<UnmapStatus, KernelError>;

    /// Finds the next hop from the caller towards `dest` in the clan tree
    fn id_nearest(&self, caller: ThreadId, dest: ThreadId) -> Result<Nearest, KernelError>;

    /// Creates, deletes or hands over a task slot
    fn task_new(
        &self,
        caller: ThreadId,
        request: TaskNewRequest,
    ) -> Result<TaskNewReply<Self::Guard<'_>>, KernelError>;

    /// Returns the kernel clock
    fn now(&self) -> Instant;
}
