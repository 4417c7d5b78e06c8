//! # Simulated Kernel
//!
//! This crate provides a simulated implementation of the kernel API.
//!
//! ## Purpose
//!
//! The simulated kernel allows testing the scheduling and task-control
//! plane without hardware:
//! - Runs under `cargo test`
//! - Deterministic (controlled time, planned races)
//! - Inspectable (all state is accessible)
//!
//! ## Locking
//!
//! All kernel state sits behind one CPU lock, a [`spin::Mutex`]. Syscalls
//! take it in short sections and may drop it in between, so a syscall can
//! observe the writes of a concurrent one. Thread locks ([`ThreadLockGuard`])
//! are held across sections and released on drop.

pub mod config;
pub mod ex_regs;
pub mod fault_injection;
pub mod mapdb;
pub mod preemption;
pub mod sched_context;
pub mod scheduler;
pub mod space_index;
pub mod syscall_gate;
pub mod task;
pub mod test_utils;
pub mod thread;
pub mod thread_lock;
pub mod thread_schedule;
pub mod timer;

pub use config::{ConfigError, KernelConfig};
pub use fault_injection::{RaceFault, RacePlan};
pub use mapdb::{SharedMappingDb, SimMappingDb};
pub use preemption::{PreemptionKind, PreemptionNotice};
pub use scheduler::ScheduleEvent;
pub use task::Task;
pub use thread::{SchedMode, Thread, ThreadState};
pub use thread_lock::ThreadLockGuard;

use core_types::{TaskNo, ThreadId, ThreadKey};
use fault_injection::RaceInjector;
use kernel_api::{
    Duration, ExRegsReply, ExRegsRequest, Instant, KernelApi, KernelError, MappingDatabase,
    Nearest, ScheduleReply, ScheduleVerb, TaskNewReply, TaskNewRequest, ThreadSwitchReply,
    UnmapRequest, UnmapStatus,
};
use log::{debug, info, warn};
use preemption::PreemptionQueues;
use resources::{QuotaId, QuotaTree, RamQuota};
use scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use space_index::SpaceIndex;
use std::collections::BTreeMap;
use std::fmt;
use thread::Initialization;
use timer::{SimClock, TimeoutQueue};
use uuid::Uuid;

/// Rejected attempt to act on another task's threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEvent {
    /// Cross-task ex_regs by a task that is neither pager nor capability handler
    ExRegsDenied {
        caller: ThreadId,
        target: ThreadId,
        timestamp_micros: u64,
    },
    /// task_new on a slot the caller is not chief of
    TaskNewDenied {
        caller: ThreadId,
        task: TaskNo,
        timestamp_micros: u64,
    },
}

/// Everything guarded by the CPU lock
pub struct KernelState {
    pub(crate) config: KernelConfig,
    pub(crate) clock: SimClock,
    pub(crate) threads: BTreeMap<ThreadKey, Thread>,
    pub(crate) tasks: BTreeMap<TaskNo, Task>,
    pub(crate) space_index: SpaceIndex,
    pub(crate) quotas: QuotaTree,
    pub(crate) scheduler: Scheduler,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) preemptions: PreemptionQueues,
    pub(crate) mapdb: Box<dyn MappingDatabase>,
    pub(crate) races: RaceInjector,
    pub(crate) security_log: Vec<SecurityEvent>,
}

impl KernelState {
    /// Builds the root task and its first thread
    fn boot(config: KernelConfig) -> Self {
        let root = config.boot_task;
        let mut state = Self {
            clock: SimClock::new(),
            threads: BTreeMap::new(),
            tasks: BTreeMap::new(),
            space_index: SpaceIndex::new(config.max_tasks, root),
            quotas: QuotaTree::new(config.boot_quota),
            scheduler: Scheduler::new(),
            timeouts: TimeoutQueue::new(),
            preemptions: PreemptionQueues::new(),
            mapdb: Box::new(SimMappingDb::new()),
            races: RaceInjector::default(),
            security_log: Vec::new(),
            config,
        };

        let charged = state.config.task_size + state.config.tcb_size;
        if let Err(err) = state.quotas.alloc(QuotaId::ROOT, charged) {
            warn!("boot task does not fit its quota: {}", err);
        }
        let incarnation = Uuid::new_v4();
        state.tasks.insert(
            root,
            Task {
                number: root,
                incarnation,
                quota: QuotaId::ROOT,
                charged,
                cap_handler_space: None,
                nest: 0,
            },
        );

        let id = ThreadId::main(root);
        let mut thread = Thread::new(
            id,
            incarnation,
            state.config.boot_prio,
            state.config.boot_mcp,
            state.config.default_quantum,
        );
        thread.initialize(&Initialization::default());
        state.threads.insert(id.key(), thread);
        state.sync_ready(id.key());
        state.schedule();

        info!(
            "kernel booted: {} task slots, root task {}",
            state.config.max_tasks, root
        );
        state
    }

    /// Caller of a syscall; sentinels and dead threads are rejected
    pub(crate) fn live_thread(&self, id: ThreadId) -> Result<&Thread, KernelError> {
        self.lookup(id)
            .filter(|t| !t.is_dead())
            .ok_or(KernelError::InvalidCaller(id))
    }

    /// Thread named by `id`, ignoring its nest
    pub(crate) fn lookup(&self, id: ThreadId) -> Option<&Thread> {
        if id.is_sentinel() {
            return None;
        }
        self.threads.get(&id.key())
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn space_index(&self) -> &SpaceIndex {
        &self.space_index
    }

    pub fn quotas(&self) -> &QuotaTree {
        &self.quotas
    }

    pub fn timeouts(&self) -> &TimeoutQueue {
        &self.timeouts
    }

    pub fn security_log(&self) -> &[SecurityEvent] {
        &self.security_log
    }

    fn blocked_thread(&mut self, id: ThreadId) -> Result<&mut Thread, KernelError> {
        if id.is_sentinel() {
            return Err(KernelError::NotFound(id));
        }
        self.threads
            .get_mut(&id.key())
            .filter(|t| !t.is_dead())
            .ok_or(KernelError::NotFound(id))
    }

    /// Blocks `thread` in an IPC with `partner`
    pub(crate) fn park_in_ipc(
        &mut self,
        thread: ThreadId,
        partner: ThreadId,
        receiving: bool,
    ) -> Result<(), KernelError> {
        let waiting = if receiving {
            ThreadState::RECEIVING
        } else {
            ThreadState::POLLING
        };
        let t = self.blocked_thread(thread)?;
        t.state_change(ThreadState::READY, ThreadState::IPC_IN_PROGRESS | waiting);
        t.set_partner(Some(partner));
        self.sync_ready(thread.key());
        self.schedule();
        Ok(())
    }

    /// Completes the IPC `thread` is blocked in
    pub(crate) fn finish_ipc(&mut self, thread: ThreadId) -> Result<(), KernelError> {
        let t = self.blocked_thread(thread)?;
        t.state_change(
            ThreadState::IPC_IN_PROGRESS | ThreadState::POLLING | ThreadState::RECEIVING,
            ThreadState::READY,
        );
        t.set_partner(None);
        self.sync_ready(thread.key());
        self.schedule();
        Ok(())
    }

    /// Blocks a periodic thread until its next period begins
    ///
    /// Non-strict threads also postpone their IPC to the next period.
    pub(crate) fn wait_for_next_period(&mut self, thread: ThreadId) -> Result<(), KernelError> {
        let t = self.blocked_thread(thread)?;
        let SchedMode::Periodic { strict } = t.mode() else {
            return Err(KernelError::NotPeriodic);
        };
        let mut delayed = ThreadState::DELAYED_DEADLINE;
        if !strict {
            delayed |= ThreadState::DELAYED_IPC;
        }
        t.state_change(ThreadState::READY, delayed);
        self.sync_ready(thread.key());
        self.schedule();
        Ok(())
    }
}

/// Simulated kernel
///
/// Unlike a real kernel, its state is directly accessible for testing
/// through the inspection methods and [`SimulatedKernel::inspect`].
pub struct SimulatedKernel {
    config: KernelConfig,
    cpu: spin::Mutex<KernelState>,
}

impl fmt::Debug for SimulatedKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedKernel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SimulatedKernel {
    /// Boots a kernel with the default configuration
    pub fn new() -> Self {
        Self::boot(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::boot(config))
    }

    fn boot(config: KernelConfig) -> Self {
        Self {
            cpu: spin::Mutex::new(KernelState::boot(config.clone())),
            config,
        }
    }

    /// Replaces the mapping database `fpage_unmap` walks
    pub fn with_mapping_database(self, mapdb: Box<dyn MappingDatabase>) -> Self {
        self.with_cpu_lock(|s| s.mapdb = mapdb);
        self
    }

    /// Arms the races `task_new` should run into
    pub fn with_race_plan(self, plan: RacePlan) -> Self {
        self.with_cpu_lock(|s| s.races = RaceInjector::new(plan));
        self
    }

    /// Runs `f` under the CPU lock
    ///
    /// `f` must not drop a [`ThreadLockGuard`]: releasing a thread lock takes
    /// the CPU lock again.
    pub(crate) fn with_cpu_lock<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut state = self.cpu.lock();
        f(&mut state)
    }

    /// Read-only view of the whole kernel state
    pub fn inspect<R>(&self, f: impl FnOnce(&KernelState) -> R) -> R {
        let state = self.cpu.lock();
        f(&state)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Advances simulated time, expiring timeslices and firing deadlines
    pub fn advance_time(&self, duration: Duration) {
        self.with_cpu_lock(|s| s.advance_time(duration));
    }

    /// First thread of the root task
    pub fn boot_thread(&self) -> ThreadId {
        ThreadId::main(self.config.boot_task)
    }

    pub fn current_thread(&self) -> Option<ThreadKey> {
        self.inspect(|s| s.scheduler.current())
    }

    pub fn timeslice_left(&self) -> Duration {
        self.inspect(|s| s.scheduler.timeslice_left())
    }

    pub fn thread(&self, id: ThreadId) -> Option<Thread> {
        self.inspect(|s| s.lookup(id).cloned())
    }

    pub fn task(&self, task: TaskNo) -> Option<Task> {
        self.inspect(|s| s.tasks.get(&task).cloned())
    }

    pub fn task_count(&self) -> usize {
        self.inspect(|s| s.tasks.len())
    }

    pub fn chief_of(&self, task: TaskNo) -> Option<TaskNo> {
        self.inspect(|s| s.space_index.chief(task))
    }

    pub fn quota(&self, id: QuotaId) -> Option<RamQuota> {
        self.inspect(|s| s.quotas.get(id).cloned())
    }

    /// Bytes currently charged against the root quota
    pub fn quota_usage(&self) -> u64 {
        self.inspect(|s| s.quotas.get(QuotaId::ROOT).map(|q| q.current()).unwrap_or(0))
    }

    /// Next period boundary armed for a periodic thread
    pub fn deadline_of(&self, thread: ThreadId) -> Option<Instant> {
        self.inspect(|s| s.timeouts.deadline_of(thread.key()))
    }

    pub fn schedule_log(&self) -> Vec<ScheduleEvent> {
        self.inspect(|s| s.scheduler.audit_log().to_vec())
    }

    pub fn has_schedule_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&ScheduleEvent) -> bool,
    {
        self.inspect(|s| s.scheduler.audit_log().iter().any(predicate))
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.inspect(|s| s.security_log.clone())
    }

    pub fn has_security_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SecurityEvent) -> bool,
    {
        self.inspect(|s| s.security_log.iter().any(predicate))
    }

    /// Notices queued for `receiver`, oldest first
    pub fn pending_preemptions(&self, receiver: ThreadId) -> Vec<PreemptionNotice> {
        self.inspect(|s| s.preemptions.pending(receiver.key()))
    }

    /// Receives the oldest preemption notice queued for `receiver`
    pub fn take_preemption(&self, receiver: ThreadId) -> Option<PreemptionNotice> {
        self.with_cpu_lock(|s| s.take_preemption(receiver.key()))
    }

    /// Blocks `thread` sending to (or receiving from) `partner`
    pub fn park_in_ipc(
        &self,
        thread: ThreadId,
        partner: ThreadId,
        receiving: bool,
    ) -> Result<(), KernelError> {
        self.with_cpu_lock(|s| s.park_in_ipc(thread, partner, receiving))
    }

    pub fn finish_ipc(&self, thread: ThreadId) -> Result<(), KernelError> {
        self.with_cpu_lock(|s| s.finish_ipc(thread))
    }

    /// `thread` waits for its next period, as a next-period IPC would
    pub fn wait_for_next_period(&self, thread: ThreadId) -> Result<(), KernelError> {
        self.with_cpu_lock(|s| s.wait_for_next_period(thread))
    }

    #[cfg(test)]
    pub(crate) fn set_mcp_for_test(&self, thread: ThreadId, mcp: kernel_api::Prio) {
        self.with_cpu_lock(|s| {
            if let Some(t) = s.threads.get_mut(&thread.key()) {
                t.set_mcp(mcp);
            }
        });
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn trace_exit<T: fmt::Debug>(name: &str, caller: ThreadId, result: &Result<T, KernelError>) {
    match result {
        Ok(reply) => debug!("{} {} -> {:?}", caller, name, reply),
        Err(err) => debug!("{} {} failed: {}", caller, name, err),
    }
}

impl KernelApi for SimulatedKernel {
    type Guard<'a> = ThreadLockGuard<'a>;

    fn thread_switch(
        &self,
        caller: ThreadId,
        dest: ThreadId,
    ) -> Result<ThreadSwitchReply, KernelError> {
        debug!("{} thread_switch to {}", caller, dest);
        let result = self.with_cpu_lock(|s| s.thread_switch(caller, dest));
        trace_exit("thread_switch", caller, &result);
        result
    }

    fn thread_schedule(
        &self,
        caller: ThreadId,
        dest: ThreadId,
        verb: ScheduleVerb,
        preempter: ThreadId,
    ) -> Result<ScheduleReply, KernelError> {
        debug!("{} thread_schedule {} on {}", caller, verb.name(), dest);
        let result = self.do_thread_schedule(caller, dest, verb, preempter);
        trace_exit("thread_schedule", caller, &result);
        result
    }

    fn lthread_ex_regs(
        &self,
        caller: ThreadId,
        request: ExRegsRequest,
    ) -> Result<ExRegsReply, KernelError> {
        debug!(
            "{} lthread_ex_regs on {:?}/{:?}",
            caller, request.task, request.lthread
        );
        let result = self.do_lthread_ex_regs(caller, request);
        trace_exit("lthread_ex_regs", caller, &result);
        result
    }

    fn fpage_unmap(
        &self,
        caller: ThreadId,
        request: UnmapRequest,
    ) -> Result<UnmapStatus, KernelError> {
        debug!("{} fpage_unmap {:?}", caller, request.fpage);
        let result = self.with_cpu_lock(|s| s.fpage_unmap(caller, request));
        trace_exit("fpage_unmap", caller, &result);
        result
    }

    fn id_nearest(&self, caller: ThreadId, dest: ThreadId) -> Result<Nearest, KernelError> {
        let result = self.with_cpu_lock(|s| s.id_nearest(caller, dest));
        trace_exit("id_nearest", caller, &result);
        result
    }

    fn task_new(
        &self,
        caller: ThreadId,
        request: TaskNewRequest,
    ) -> Result<TaskNewReply<Self::Guard<'_>>, KernelError> {
        debug!("{} task_new {}", caller, request.task);
        let result = self.do_task_new(caller, request);
        match &result {
            Ok(reply) => debug!("{} task_new -> {}", caller, reply.id()),
            Err(err) => debug!("{} task_new failed: {}", caller, err),
        }
        result
    }

    fn now(&self) -> Instant {
        self.inspect(|s| s.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_kernel, spawn_thread};
    use core_types::LThreadNo;

    #[test]
    fn test_boot_creates_root_task() {
        let (kernel, boot) = boot_kernel();
        assert_eq!(boot, ThreadId::main(TaskNo(4)));
        assert_eq!(kernel.current_thread(), Some(boot.key()));

        let thread = kernel.thread(boot).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.sched().prio(), 0x10);
        assert_eq!(thread.mcp(), 0xff);

        let task = kernel.task(TaskNo(4)).unwrap();
        assert_eq!(task.quota(), QuotaId::ROOT);
        assert_eq!(task.nest(), 0);
        assert_eq!(kernel.task_count(), 1);
    }

    #[test]
    fn test_boot_charges_root_quota() {
        let kernel = SimulatedKernel::new();
        let config = KernelConfig::default();
        assert_eq!(kernel.quota_usage(), config.task_size + config.tcb_size);
    }

    #[test]
    fn test_with_config_validates() {
        let config = KernelConfig {
            boot_task: TaskNo::KERNEL,
            ..KernelConfig::default()
        };
        assert!(matches!(
            SimulatedKernel::with_config(config),
            Err(ConfigError::BootTaskIsKernel)
        ));
    }

    #[test]
    fn test_custom_boot_task() {
        let config = KernelConfig {
            boot_task: TaskNo(2),
            ..KernelConfig::default()
        };
        let kernel = SimulatedKernel::with_config(config).unwrap();
        assert_eq!(kernel.boot_thread(), ThreadId::main(TaskNo(2)));
        assert!(kernel.task(TaskNo(2)).is_some());
        assert!(kernel.task(TaskNo(4)).is_none());
    }

    #[test]
    fn test_sentinels_are_not_threads() {
        let (kernel, boot) = boot_kernel();
        assert!(kernel.thread(ThreadId::NIL).is_none());
        assert!(kernel.thread(ThreadId::INVALID).is_none());
        assert_eq!(
            kernel.thread_switch(ThreadId::INVALID, boot),
            Err(KernelError::InvalidCaller(ThreadId::INVALID))
        );
    }

    #[test]
    fn test_ipc_blocks_and_wakes() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));

        kernel.park_in_ipc(worker, boot, true).unwrap();
        let parked = kernel.thread(worker).unwrap();
        assert!(!parked.is_ready());
        assert_eq!(parked.ipc_partner(), Some(boot));

        kernel.finish_ipc(worker).unwrap();
        let woken = kernel.thread(worker).unwrap();
        assert!(woken.is_ready());
        assert_eq!(woken.ipc_partner(), None);
    }

    #[test]
    fn test_next_period_needs_periodic_thread() {
        let (kernel, boot) = boot_kernel();
        assert_eq!(
            kernel.wait_for_next_period(boot),
            Err(KernelError::NotPeriodic)
        );
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let (kernel, _) = boot_kernel();
        assert_eq!(kernel.now(), Instant::from_micros(0));
        kernel.advance_time(Duration::from_millis(3));
        assert_eq!(kernel.now(), Instant::from_micros(3_000));
    }
}
