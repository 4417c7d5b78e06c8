//! Tasks and the task_new syscall
//!
//! A task is a slot in the chief table plus the memory budget its threads
//! are charged against. Only the chief of a slot may fill, empty or hand
//! over that slot. Emptying a slot deletes the whole subtree of tasks the
//! incumbent is (transitively) chief of.

use crate::thread::Initialization;
use crate::thread_lock::{LockTicket, ThreadLockGuard};
use crate::{KernelState, SecurityEvent, SimulatedKernel};
use core_types::{LThreadNo, TaskNo, ThreadId, ThreadKey};
use kernel_api::{
    ClanRelation, ExRegsFlags, KernelError, Nearest, Prio, QuotaDescriptor, TaskNewKind,
    TaskNewReply, TaskNewRequest, TaskSpec,
};
use log::{debug, warn};
use resources::QuotaId;
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

/// An occupied task slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub(crate) number: TaskNo,
    pub(crate) incarnation: Uuid,
    pub(crate) quota: QuotaId,
    /// Bytes charged against `quota` on behalf of this task
    pub(crate) charged: u64,
    /// Task allowed to act as capability handler of this one
    pub(crate) cap_handler_space: Option<TaskNo>,
    pub(crate) nest: u8,
}

impl Task {
    pub fn number(&self) -> TaskNo {
        self.number
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn quota(&self) -> QuotaId {
        self.quota
    }

    pub fn charged(&self) -> u64 {
        self.charged
    }

    pub fn cap_handler_space(&self) -> Option<TaskNo> {
        self.cap_handler_space
    }

    pub fn nest(&self) -> u8 {
        self.nest
    }

    pub fn main_thread(&self) -> ThreadId {
        ThreadId::main(self.number).with_nest(self.nest)
    }
}

/// Caller attributes captured at syscall entry
#[derive(Debug, Clone, Copy)]
struct Creator {
    id: ThreadId,
    task: TaskNo,
    prio: Prio,
    mcp: Prio,
}

impl KernelState {
    /// Thread 0 id of `task` with its real nesting depth
    pub(crate) fn main_id(&self, task: TaskNo) -> ThreadId {
        ThreadId::main(task).with_nest(self.space_index.depth(task))
    }

    fn creator(&self, caller: ThreadId) -> Result<Creator, KernelError> {
        let thread = self.live_thread(caller)?;
        Ok(Creator {
            id: thread.id(),
            task: thread.id().task,
            prio: thread.sched().prio(),
            mcp: thread.mcp(),
        })
    }

    /// Checks that `creator` administers `slot`
    fn check_chief(&mut self, creator: Creator, slot: TaskNo) -> Result<(), KernelError> {
        if !self.space_index.in_range(slot) || slot == TaskNo::KERNEL {
            return Err(KernelError::TaskNotFound(slot));
        }
        let chief = self.space_index.chief(slot);
        if slot == creator.task || chief != Some(creator.task) {
            warn!(
                "Security violation: {} is not chief of {}",
                creator.id, slot
            );
            self.security_log.push(SecurityEvent::TaskNewDenied {
                caller: creator.id,
                task: slot,
                timestamp_micros: self.clock.now().as_micros(),
            });
            return Err(KernelError::NotChief {
                caller: creator.task,
                task: slot,
            });
        }
        Ok(())
    }

    /// Occupied tasks of the subtree rooted at `root`, deepest first
    fn subtree_post_order(&self, root: TaskNo) -> Vec<TaskNo> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(task) = queue.pop_front() {
            if !seen.insert(task) {
                continue;
            }
            if self.tasks.contains_key(&task) {
                order.push(task);
            }
            queue.extend(self.space_index.subtasks(task));
        }
        order.reverse();
        order
    }

    fn threads_of(&self, task: TaskNo) -> Vec<ThreadKey> {
        let first = ThreadKey::main(task);
        let last = ThreadKey::new(task, LThreadNo(u8::MAX));
        self.threads.range(first..=last).map(|(k, _)| *k).collect()
    }

    fn delete_thread(&mut self, key: ThreadKey) {
        self.scheduler.forget(key);
        self.timeouts.cancel(key);
        self.cancel_preemption(key);
        for notice in self.preemptions.remove_receiver(key) {
            if let Some(sender) = self.threads.get_mut(&notice.thread.key()) {
                sender.set_preemption_pending(false);
            }
        }
        self.threads.remove(&key);
    }

    /// Deletes `victim` and every task it is chief of
    ///
    /// Nothing is touched if a thread of the subtree is locked by someone
    /// other than `killer`.
    pub(crate) fn kill_task(&mut self, victim: TaskNo, killer: ThreadKey) -> Result<(), KernelError> {
        let order = self.subtree_post_order(victim);

        let contended = order.iter().flat_map(|&t| self.threads_of(t)).any(|key| {
            self.threads
                .get(&key)
                .and_then(|t| t.lock_owner())
                .map(|owner| owner.key() != killer)
                .unwrap_or(false)
        });
        if contended {
            debug!("kill of {} refused: thread locked", victim);
            return Err(KernelError::KillFailed(victim));
        }

        for task in order {
            for key in self.threads_of(task) {
                self.delete_thread(key);
            }
            if let Some(dead) = self.tasks.remove(&task) {
                self.quotas.free(dead.quota, dead.charged);
                if let Err(err) = self.quotas.release(dead.quota) {
                    warn!("{}: quota {} not released: {}", task, dead.quota, err);
                }
            }
            debug!("{} deleted", task);
        }
        self.schedule();
        Ok(())
    }

    fn resolve_quota(&mut self, creator: Creator, quota: QuotaDescriptor) -> Result<QuotaId, KernelError> {
        let own = self
            .tasks
            .get(&creator.task)
            .map(|t| t.quota)
            .ok_or(KernelError::TaskNotFound(creator.task))?;

        let reference = |s: &Self, task: TaskNo| -> Result<QuotaId, KernelError> {
            if task != creator.task && s.space_index.chief(task) != Some(creator.task) {
                return Err(KernelError::NotChief {
                    caller: creator.task,
                    task,
                });
            }
            s.tasks
                .get(&task)
                .map(|t| t.quota)
                .ok_or(KernelError::TaskNotFound(task))
        };

        let id = match quota {
            QuotaDescriptor::Inherit => self.quotas.share(own)?,
            QuotaDescriptor::Share { task } => {
                let q = reference(&*self, task)?;
                self.quotas.share(q)?
            }
            QuotaDescriptor::New { task, max } => {
                let q = reference(&*self, task)?;
                self.quotas.alloc_child(q, max)?
            }
        };
        Ok(id)
    }

    /// Installs a bare task in `slot` as if another creator got there first
    fn install_competitor(&mut self, slot: TaskNo) {
        let Some(chief) = self.space_index.chief(slot) else {
            return;
        };
        let Some(quota) = self.tasks.get(&chief).map(|t| t.quota) else {
            return;
        };
        if self.quotas.share(quota).is_err() {
            return;
        }
        let task_size = self.config.task_size;
        if self.quotas.alloc(quota, task_size).is_err() {
            let _ = self.quotas.release(quota);
            return;
        }
        let nest = self.space_index.depth(slot);
        self.tasks.insert(
            slot,
            Task {
                number: slot,
                incarnation: Uuid::new_v4(),
                quota,
                charged: task_size,
                cap_handler_space: None,
                nest,
            },
        );
        debug!("competitor installed in {}", slot);
    }

    fn transfer_chief(
        &mut self,
        creator: Creator,
        slot: TaskNo,
        new_chief: TaskNo,
    ) -> Result<ThreadId, KernelError> {
        if self.space_index.is_in_subtree(new_chief, slot) {
            return Err(KernelError::ChiefCycle {
                task: slot,
                new_chief,
            });
        }
        if !self.space_index.in_range(new_chief) || !self.tasks.contains_key(&new_chief) {
            return Err(KernelError::TaskNotFound(new_chief));
        }

        if let Some(thief) = self.races.take_steal_chief(slot) {
            self.space_index.compare_and_set_chief(slot, creator.task, thief);
        }
        if !self
            .space_index
            .compare_and_set_chief(slot, creator.task, new_chief)
        {
            return Err(KernelError::ChiefTransferLost(slot));
        }

        debug!("chief of {} handed from {} to {}", slot, creator.task, new_chief);
        Ok(self.main_id(slot))
    }

    /// Builds the task object and returns its incarnation
    ///
    /// `Ok(None)` means another creator won the slot.
    fn install_task(
        &mut self,
        creator: Creator,
        slot: TaskNo,
        spec: &TaskSpec,
    ) -> Result<Option<Uuid>, KernelError> {
        let quota = self.resolve_quota(creator, spec.quota)?;
        let task_size = self.config.task_size;
        if let Err(err) = self.quotas.alloc(quota, task_size) {
            let _ = self.quotas.release(quota);
            return Err(err.into());
        }

        if self.races.take_competitor(slot) {
            self.install_competitor(slot);
        }

        if self.tasks.contains_key(&slot) || self.space_index.chief(slot) != Some(creator.task) {
            self.quotas.free(quota, task_size);
            let _ = self.quotas.release(quota);
            return Ok(None);
        }

        let cap_handler_space = self.lookup(spec.cap_handler).map(|t| t.id().task);
        let nest = self.space_index.depth(creator.task).saturating_add(1);
        let incarnation = Uuid::new_v4();
        self.tasks.insert(
            slot,
            Task {
                number: slot,
                incarnation,
                quota,
                charged: task_size,
                cap_handler_space,
                nest,
            },
        );
        Ok(Some(incarnation))
    }

    /// Empties `slot` and fills it with a bare task of another creator
    fn supersede(&mut self, slot: TaskNo, creator: Creator) {
        if self.kill_task(slot, creator.id.key()).is_ok() {
            self.install_competitor(slot);
        }
    }

    /// Creates thread 0 of the task `install_task` put in `slot`
    ///
    /// `Ok(None)` means the slot no longer holds that incarnation, or its
    /// thread 0 already exists. A failed build deletes the task again.
    fn build_main_thread(
        &mut self,
        creator: Creator,
        slot: TaskNo,
        incarnation: Uuid,
        spec: &TaskSpec,
    ) -> Result<Option<LockTicket>, KernelError> {
        if self.races.take_supersede(slot) {
            self.supersede(slot, creator);
        }

        let main = ThreadKey::main(slot);
        let ours = self.tasks.get(&slot).map(|t| t.incarnation) == Some(incarnation);
        if !ours || self.threads.contains_key(&main) {
            return Ok(None);
        }

        let mcp = creator.mcp.min(spec.mcp);
        let init = Initialization {
            ip: Some(spec.ip),
            sp: Some(spec.sp),
            pager: self.lookup(spec.pager).map(|t| t.id()),
            preempter: None,
            cap_handler: self.lookup(spec.cap_handler).map(|t| t.id()),
            flags: spec.flags & (ExRegsFlags::ALIEN | ExRegsFlags::TRIGGER_EXCEPTION),
        };
        let built = self
            .create_thread_locked(creator.id.key(), main, creator.prio, mcp)
            .and_then(|ticket| {
                self.initialize_thread(main, &init)?;
                Ok(ticket)
            });

        match built {
            Ok(ticket) => Ok(Some(ticket)),
            Err(err) => {
                if self.kill_task(slot, creator.id.key()).is_err() {
                    warn!("{}: unwinding half-built task failed", slot);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn id_nearest(&self, caller: ThreadId, dest: ThreadId) -> Result<Nearest, KernelError> {
        let me = self.live_thread(caller)?.id();

        if dest.is_nil() {
            return Ok(Nearest {
                id: me,
                relation: ClanRelation::SameClan,
            });
        }
        if dest.is_invalid() {
            let chief = self.space_index.chief(me.task).unwrap_or(self.space_index.root());
            return Ok(Nearest {
                id: self.main_id(chief),
                relation: ClanRelation::OuterClan,
            });
        }
        if !self.space_index.in_range(dest.task) {
            return Err(KernelError::NotFound(dest));
        }

        let (hop, relation) = self.space_index.nearest(me.task, dest.task);
        let id = match relation {
            ClanRelation::SameClan => self.main_id(dest.task),
            _ => self.main_id(hop),
        };
        Ok(Nearest { id, relation })
    }
}

impl SimulatedKernel {
    pub(crate) fn do_task_new(
        &self,
        caller: ThreadId,
        request: TaskNewRequest,
    ) -> Result<TaskNewReply<ThreadLockGuard<'_>>, KernelError> {
        let limit = self.config.task_new_retry_limit;
        for attempt in 1..=limit {
            if let Some(reply) = self.try_task_new(caller, request)? {
                return Ok(reply);
            }
            debug!(
                "task_new {}: slot taken by a racing creator (attempt {})",
                request.task, attempt
            );
        }
        Err(KernelError::RetryLimitExceeded(limit))
    }

    fn try_task_new(
        &self,
        caller: ThreadId,
        request: TaskNewRequest,
    ) -> Result<Option<TaskNewReply<ThreadLockGuard<'_>>>, KernelError> {
        let slot = request.task;

        let creator = self.with_cpu_lock(|s| {
            let creator = s.creator(caller)?;
            s.check_chief(creator, slot)?;
            if s.tasks.contains_key(&slot) {
                s.kill_task(slot, creator.id.key())?;
            }
            Ok::<_, KernelError>(creator)
        })?;

        let spec = match request.kind {
            TaskNewKind::TransferChief { new_chief } => {
                let id = self.with_cpu_lock(|s| s.transfer_chief(creator, slot, new_chief))?;
                return Ok(Some(TaskNewReply::Transferred { id }));
            }
            TaskNewKind::Create(spec) => spec,
        };

        let Some(incarnation) = self.with_cpu_lock(|s| s.install_task(creator, slot, &spec))? else {
            return Ok(None);
        };

        let built =
            self.with_cpu_lock(|s| s.build_main_thread(creator, slot, incarnation, &spec))?;
        let Some(ticket) = built else {
            debug!("{}: replaced before thread 0 was built", slot);
            return Ok(None);
        };

        debug!("{} created by {}", slot, creator.id);
        Ok(Some(TaskNewReply::Created {
            id: ticket.target,
            guard: ThreadLockGuard::new(self, ticket),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_injection::{RaceFault, RacePlan};
    use crate::test_utils::{boot_kernel, init_logging, spawn_task, spawn_thread};
    use crate::KernelConfig;
    use kernel_api::{KernelApi, ThreadLock};

    fn spec(pager: ThreadId) -> TaskSpec {
        TaskSpec::new(0x1000, 0x2000, pager)
    }

    #[test]
    fn test_create_returns_locked_thread() {
        let (kernel, boot) = boot_kernel();
        let reply = kernel
            .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
            .unwrap();
        let id = reply.id();
        assert_eq!(id, ThreadId::main(TaskNo(5)).with_nest(1));

        let guard = reply.into_guard().unwrap();
        assert_eq!(guard.target(), id);
        let thread = kernel.thread(id).unwrap();
        assert_eq!(thread.lock_owner(), Some(boot));
        assert_eq!(thread.user_ip(), 0x1000);
        assert_eq!(thread.pager(), Some(boot));
        assert!(thread.is_ready());

        drop(guard);
        assert_eq!(kernel.thread(id).unwrap().lock_owner(), None);
    }

    #[test]
    fn test_mcp_is_bounded_by_creator() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        drop(kernel.task_new(boot, TaskNewRequest::transfer(TaskNo(6), TaskNo(5))).unwrap());
        kernel.set_mcp_for_test(child, 0x20);

        let reply = kernel
            .task_new(child, TaskNewRequest::create(TaskNo(6), spec(child)))
            .unwrap();
        let id = reply.id();
        drop(reply);
        assert_eq!(kernel.thread(id).unwrap().mcp(), 0x20);
        assert_eq!(id.nest, 2);
    }

    #[test]
    fn test_only_flags_alien_and_exception_survive() {
        let (kernel, boot) = boot_kernel();
        let task_spec = spec(boot).with_flags(ExRegsFlags::NO_CANCEL | ExRegsFlags::ALIEN);
        let reply = kernel
            .task_new(boot, TaskNewRequest::create(TaskNo(5), task_spec))
            .unwrap();
        let id = reply.id();
        drop(reply);
        assert!(kernel
            .thread(id)
            .unwrap()
            .state()
            .contains(crate::thread::ThreadState::ALIEN));
    }

    #[test]
    fn test_non_chief_is_rejected() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));

        let err = kernel
            .task_new(child, TaskNewRequest::create(TaskNo(7), spec(child)))
            .unwrap_err();
        assert_eq!(
            err,
            KernelError::NotChief {
                caller: TaskNo(5),
                task: TaskNo(7)
            }
        );
        assert!(kernel.has_security_event(|e| matches!(e, SecurityEvent::TaskNewDenied { .. })));
    }

    #[test]
    fn test_kernel_and_own_slot_are_rejected() {
        let (kernel, boot) = boot_kernel();
        assert_eq!(
            kernel
                .task_new(boot, TaskNewRequest::create(TaskNo(0), spec(boot)))
                .unwrap_err(),
            KernelError::TaskNotFound(TaskNo(0))
        );
        assert!(matches!(
            kernel.task_new(boot, TaskNewRequest::create(TaskNo(4), spec(boot))),
            Err(KernelError::NotChief { .. })
        ));
    }

    #[test]
    fn test_recreate_kills_incumbent_subtree() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        let transfer = TaskNewRequest::transfer(TaskNo(9), TaskNo(5));
        drop(kernel.task_new(boot, transfer).unwrap());
        let grandchild = kernel
            .task_new(child, TaskNewRequest::create(TaskNo(9), spec(child)))
            .unwrap()
            .id();
        assert_eq!(grandchild.nest, 2);

        let fresh = kernel
            .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
            .unwrap();
        let fresh_id = fresh.id();
        drop(fresh);

        assert!(kernel.thread(grandchild).is_none());
        assert!(kernel.task(TaskNo(9)).is_none());
        assert!(kernel.thread(fresh_id).is_some());
    }

    #[test]
    fn test_kill_fails_while_thread_is_locked_by_other() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        let other = spawn_task(&kernel, boot, TaskNo(6));
        let _held = kernel.lock_thread(other, child).unwrap();

        assert_eq!(
            kernel
                .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
                .unwrap_err(),
            KernelError::KillFailed(TaskNo(5))
        );
        assert!(kernel.thread(child).is_some());
    }

    #[test]
    fn test_transfer_consumes_no_quota() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        let before = kernel.quota_usage();

        let reply = kernel
            .task_new(boot, TaskNewRequest::transfer(TaskNo(8), TaskNo(5)))
            .unwrap();
        assert!(matches!(reply, TaskNewReply::Transferred { .. }));
        assert_eq!(reply.id(), ThreadId::main(TaskNo(8)).with_nest(2));
        assert_eq!(kernel.quota_usage(), before);
        assert_eq!(kernel.chief_of(TaskNo(8)), Some(child.task));
        assert!(kernel.task(TaskNo(8)).is_none());
    }

    #[test]
    fn test_transfer_to_itself_is_a_cycle() {
        let (kernel, boot) = boot_kernel();
        assert_eq!(
            kernel
                .task_new(boot, TaskNewRequest::transfer(TaskNo(5), TaskNo(5)))
                .unwrap_err(),
            KernelError::ChiefCycle {
                task: TaskNo(5),
                new_chief: TaskNo(5)
            }
        );
        assert_eq!(kernel.chief_of(TaskNo(5)), Some(TaskNo(4)));
    }

    #[test]
    fn test_transfer_into_own_subtree_is_a_cycle() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        drop(kernel.task_new(boot, TaskNewRequest::transfer(TaskNo(8), TaskNo(5))).unwrap());
        drop(
            kernel
                .task_new(child, TaskNewRequest::create(TaskNo(8), spec(child)))
                .unwrap(),
        );

        assert!(matches!(
            kernel.task_new(boot, TaskNewRequest::transfer(TaskNo(5), TaskNo(8))),
            Err(KernelError::ChiefCycle { .. })
        ));
        assert_eq!(kernel.chief_of(TaskNo(5)), Some(TaskNo(4)));
    }

    #[test]
    fn test_stolen_chief_loses_transfer() {
        init_logging();
        let plan = RacePlan::new().with_fault(RaceFault::StealChief {
            task: TaskNo(8),
            new_chief: TaskNo(6),
        });
        let kernel = SimulatedKernel::with_config(KernelConfig::default())
            .unwrap()
            .with_race_plan(plan);
        let boot = kernel.boot_thread();
        let _child = spawn_task(&kernel, boot, TaskNo(5));

        assert_eq!(
            kernel
                .task_new(boot, TaskNewRequest::transfer(TaskNo(8), TaskNo(5)))
                .unwrap_err(),
            KernelError::ChiefTransferLost(TaskNo(8))
        );
        assert_eq!(kernel.chief_of(TaskNo(8)), Some(TaskNo(6)));
    }

    #[test]
    fn test_lost_install_race_is_retried() {
        init_logging();
        let plan = RacePlan::new().with_fault(RaceFault::InstallCompetitor { task: TaskNo(5) });
        let kernel = SimulatedKernel::new().with_race_plan(plan);
        let boot = kernel.boot_thread();
        let usage = kernel.quota_usage();

        let reply = kernel
            .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
            .unwrap();
        let id = reply.id();
        drop(reply);

        assert!(kernel.thread(id).is_some());
        let config = KernelConfig::default();
        assert_eq!(kernel.quota_usage(), usage + config.task_size + config.tcb_size);
    }

    #[test]
    fn test_task_replaced_before_build_is_left_alone() {
        let (kernel, boot) = boot_kernel();
        let rival = spawn_thread(&kernel, boot, LThreadNo(1));
        let slot = TaskNo(5);
        let mine = TaskSpec::new(0xaaaa, 0x2000, boot);

        // First creator gets as far as the install
        let creator = kernel
            .with_cpu_lock(|s| {
                let creator = s.creator(boot)?;
                s.check_chief(creator, slot)?;
                Ok::<_, KernelError>(creator)
            })
            .unwrap();
        let incarnation = kernel
            .with_cpu_lock(|s| s.install_task(creator, slot, &mine))
            .unwrap()
            .unwrap();

        // A second creator runs a whole task_new on the same slot
        let theirs = kernel
            .task_new(rival, TaskNewRequest::create(slot, TaskSpec::new(0xbbbb, 0x2000, rival)))
            .unwrap();
        let their_id = theirs.id();
        drop(theirs);

        let late = kernel.with_cpu_lock(|s| s.build_main_thread(creator, slot, incarnation, &mine));
        assert!(matches!(late, Ok(None)));

        let main = kernel.thread(their_id).unwrap();
        assert_eq!(main.user_ip(), 0xbbbb);
        assert_eq!(main.pager(), Some(rival));
        assert_eq!(main.lock_owner(), None);
        assert_ne!(kernel.task(slot).unwrap().incarnation(), incarnation);
    }

    #[test]
    fn test_supersede_before_build_is_retried() {
        init_logging();
        let plan = RacePlan::new().with_fault(RaceFault::SupersedeBeforeBuild { task: TaskNo(5) });
        let kernel = SimulatedKernel::new().with_race_plan(plan);
        let boot = kernel.boot_thread();
        let usage = kernel.quota_usage();

        let reply = kernel
            .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
            .unwrap();
        let id = reply.id();
        let incarnation = kernel.thread(id).unwrap().incarnation();
        drop(reply);

        assert_eq!(kernel.task(TaskNo(5)).unwrap().incarnation(), incarnation);
        assert_eq!(kernel.thread(id).unwrap().user_ip(), 0x1000);
        let config = KernelConfig::default();
        assert_eq!(kernel.quota_usage(), usage + config.task_size + config.tcb_size);
        assert!(kernel.inspect(|s| s.races.pending().is_empty()));
    }

    #[test]
    fn test_retry_limit() {
        let config = KernelConfig {
            task_new_retry_limit: 2,
            ..KernelConfig::default()
        };
        let plan = RacePlan::new()
            .with_fault(RaceFault::InstallCompetitor { task: TaskNo(5) })
            .with_fault(RaceFault::InstallCompetitor { task: TaskNo(5) });
        let kernel = SimulatedKernel::with_config(config).unwrap().with_race_plan(plan);
        let boot = kernel.boot_thread();

        assert_eq!(
            kernel
                .task_new(boot, TaskNewRequest::create(TaskNo(5), spec(boot)))
                .unwrap_err(),
            KernelError::RetryLimitExceeded(2)
        );
    }

    #[test]
    fn test_new_quota_is_bounded() {
        let (kernel, boot) = boot_kernel();
        let config = KernelConfig::default();
        let tight = spec(boot).with_quota(QuotaDescriptor::New {
            task: TaskNo(4),
            max: config.task_size,
        });

        // Room for the task object but not for its first thread
        assert!(matches!(
            kernel.task_new(boot, TaskNewRequest::create(TaskNo(5), tight)),
            Err(KernelError::QuotaExhausted(_))
        ));
        assert!(kernel.task(TaskNo(5)).is_none());

        let roomy = spec(boot).with_quota(QuotaDescriptor::New {
            task: TaskNo(4),
            max: config.task_size + config.tcb_size,
        });
        drop(
            kernel
                .task_new(boot, TaskNewRequest::create(TaskNo(5), roomy))
                .unwrap(),
        );
    }

    #[test]
    fn test_share_needs_chief_of_reference() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        let borrow = spec(child).with_quota(QuotaDescriptor::Share { task: TaskNo(4) });
        drop(kernel.task_new(boot, TaskNewRequest::transfer(TaskNo(6), TaskNo(5))).unwrap());

        assert!(matches!(
            kernel.task_new(child, TaskNewRequest::create(TaskNo(6), borrow)),
            Err(KernelError::NotChief { .. })
        ));
    }

    #[test]
    fn test_id_nearest_sentinels() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));

        let nil = kernel.id_nearest(child, ThreadId::NIL).unwrap();
        assert_eq!(nil, Nearest { id: child, relation: ClanRelation::SameClan });

        let invalid = kernel.id_nearest(child, ThreadId::INVALID).unwrap();
        assert_eq!(invalid.id, boot);
        assert_eq!(invalid.relation, ClanRelation::OuterClan);

        assert_eq!(
            kernel.id_nearest(child, ThreadId::main(TaskNo(9999))),
            Err(KernelError::NotFound(ThreadId::main(TaskNo(9999))))
        );
    }
}
