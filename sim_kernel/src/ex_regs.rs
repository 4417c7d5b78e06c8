//! lthread_ex_regs
//!
//! Reads and replaces the user registers and handler ids of a thread,
//! creating the thread on first use. Inside one task no authorization is
//! needed. Across tasks the caller must be the fault handler (pager or
//! capability handler) of the destination.

use crate::thread::{Initialization, PreviousRegisters, Thread};
use crate::thread_lock::{LockTicket, ThreadLockGuard};
use crate::{KernelState, SecurityEvent, SimulatedKernel};
use core_types::{LThreadNo, TaskNo, ThreadId, ThreadKey};
use kernel_api::{ExRegsReply, ExRegsRequest, KernelError, Prio, UserIp};
use log::{debug, warn};

impl KernelState {
    /// Creates `key` on behalf of `owner` and returns it locked
    ///
    /// An existing thread is locked instead. New threads are charged against
    /// the quota of their task and stay DEAD until initialized.
    pub(crate) fn create_thread_locked(
        &mut self,
        owner: ThreadKey,
        key: ThreadKey,
        prio: Prio,
        mcp: Prio,
    ) -> Result<LockTicket, KernelError> {
        if self.threads.contains_key(&key) {
            return self.acquire_thread_lock(owner, key);
        }

        let owner_id = self
            .threads
            .get(&owner)
            .map(|t| t.id())
            .ok_or(KernelError::InvalidCaller(ThreadId::from(owner)))?;
        let tcb_size = self.config.tcb_size;
        let quantum = self.config.default_quantum;
        let task = self
            .tasks
            .get_mut(&key.task)
            .ok_or(KernelError::TaskNotFound(key.task))?;
        self.quotas.alloc(task.quota, tcb_size)?;
        task.charged += tcb_size;

        let id = ThreadId::new(key.task, key.lthread).with_nest(task.nest);
        let mut thread = Thread::new(id, task.incarnation, prio, mcp, quantum);
        thread.set_lock_owner(Some(owner_id));
        let ticket = LockTicket {
            target: id,
            owner: owner_id,
            incarnation: task.incarnation,
            acquired: true,
        };
        self.threads.insert(key, thread);
        debug!("{} created by {}", key, owner);
        Ok(ticket)
    }

    /// Locks thread 0 of `task` unless it is missing or dead
    fn acquire_main_lock(&mut self, owner: ThreadKey, task: TaskNo) -> Result<LockTicket, KernelError> {
        let main = ThreadKey::main(task);
        if self.threads.get(&main).filter(|t| !t.is_dead()).is_none() {
            return Err(KernelError::NotFound(ThreadId::from(main)));
        }
        self.acquire_thread_lock(owner, main)
    }

    /// Resolves a handler id to an existing thread, with its real nest
    fn resolve_handler(&self, id: ThreadId) -> Option<ThreadId> {
        self.lookup(id).map(|t| t.id())
    }

    /// Checks that `caller_task` may manipulate threads of `dst`
    fn check_fault_handler(&self, caller_task: TaskNo, dst: ThreadKey) -> Result<(), KernelError> {
        let holder = self
            .threads
            .get(&dst)
            .filter(|t| t.pager().is_some())
            .or_else(|| self.threads.get(&ThreadKey::main(dst.task)));

        let permitted = holder
            .map(|h| {
                h.pager().map(|p| p.task) == Some(caller_task)
                    || h.cap_handler().map(|c| c.task) == Some(caller_task)
            })
            .unwrap_or(false);

        if permitted {
            Ok(())
        } else {
            Err(KernelError::NotFaultHandler {
                caller: caller_task,
                task: dst.task,
            })
        }
    }

    pub(crate) fn initialize_thread(
        &mut self,
        key: ThreadKey,
        init: &Initialization,
    ) -> Result<PreviousRegisters, KernelError> {
        let previous = self
            .threads
            .get_mut(&key)
            .map(|t| t.initialize(init))
            .ok_or(KernelError::NotFound(ThreadId::from(key)))?;
        self.sync_ready(key);
        Ok(previous)
    }
}

impl SimulatedKernel {
    /// `lthread_ex_regs` that hands the destination's lock back to the caller
    pub fn lthread_ex_regs_locked(
        &self,
        caller: ThreadId,
        request: ExRegsRequest,
    ) -> Result<(ExRegsReply, ThreadLockGuard<'_>), KernelError> {
        let (me, my_task, prio, mcp) = self.with_cpu_lock(|s| {
            let t = s.live_thread(caller)?;
            Ok::<_, KernelError>((t.id(), t.id().task, t.sched().prio(), t.mcp()))
        })?;

        let dst_task = request.task.unwrap_or(my_task);
        let key = ThreadKey::new(dst_task, request.lthread);
        if !self.config.task_in_range(dst_task) || !self.config.lthread_in_range(request.lthread.0)
        {
            return Err(KernelError::NotFound(ThreadId::from(key)));
        }

        let main_guard = if dst_task != my_task {
            let ticket = self.with_cpu_lock(|s| s.acquire_main_lock(me.key(), dst_task))?;
            let guard = ThreadLockGuard::new(self, ticket);
            let verdict = self.with_cpu_lock(|s| {
                let verdict = s.check_fault_handler(my_task, key);
                if verdict.is_err() {
                    warn!(
                        "Security violation: {} tried ex_regs on {} without being its fault handler",
                        caller, key
                    );
                    s.security_log.push(SecurityEvent::ExRegsDenied {
                        caller: me,
                        target: ThreadId::from(key),
                        timestamp_micros: s.clock.now().as_micros(),
                    });
                }
                verdict
            });
            verdict?;
            Some(guard)
        } else {
            None
        };

        let ticket = self.with_cpu_lock(|s| s.create_thread_locked(me.key(), key, prio, mcp))?;
        let guard = ThreadLockGuard::new(self, ticket);
        let guard = match main_guard {
            Some(main) if request.lthread == LThreadNo::MAIN => {
                drop(guard);
                main
            }
            Some(main) => {
                drop(main);
                guard
            }
            None => guard,
        };

        let user_max = self.config.user_max;
        let reply = self.with_cpu_lock(|s| {
            let init = Initialization {
                ip: request.ip,
                sp: request.sp,
                pager: s.resolve_handler(request.pager),
                preempter: s.resolve_handler(request.preempter),
                cap_handler: s.resolve_handler(request.cap_handler),
                flags: request.flags,
            };
            let previous = s.initialize_thread(key, &init)?;
            Ok::<_, KernelError>(ExRegsReply {
                old_ip: if previous.ip >= user_max {
                    UserIp::AboveUserSplit
                } else {
                    UserIp::Valid(previous.ip)
                },
                old_sp: previous.sp,
                old_pager: previous.pager.unwrap_or(ThreadId::INVALID),
                old_preempter: previous.preempter.unwrap_or(ThreadId::INVALID),
                old_cap_handler: previous.cap_handler.unwrap_or(ThreadId::INVALID),
                old_flags: previous.flags,
            })
        })?;

        Ok((reply, guard))
    }

    pub(crate) fn do_lthread_ex_regs(
        &self,
        caller: ThreadId,
        request: ExRegsRequest,
    ) -> Result<ExRegsReply, KernelError> {
        let (reply, guard) = self.lthread_ex_regs_locked(caller, request)?;
        drop(guard);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_kernel, spawn_task};
    use crate::thread::ThreadState;
    use kernel_api::{ExRegsFlags, KernelApi, ThreadLock};

    #[test]
    fn test_local_create_reports_zeros() {
        let (kernel, boot) = boot_kernel();
        let request = ExRegsRequest::local(LThreadNo(3))
            .with_ip(0x4000)
            .with_sp(0x8000)
            .with_pager(boot);

        let reply = kernel.lthread_ex_regs(boot, request).unwrap();
        assert_eq!(reply.old_ip, UserIp::Valid(0));
        assert_eq!(reply.old_sp, 0);
        assert_eq!(reply.old_pager, ThreadId::INVALID);

        let thread = kernel.thread(boot.with_lthread(LThreadNo(3))).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.user_ip(), 0x4000);
        assert_eq!(thread.pager(), Some(boot));
        assert_eq!(thread.sched_context().prio(), 0x10);
        assert_eq!(thread.mcp(), 0xff);
    }

    #[test]
    fn test_second_call_returns_previous_values() {
        let (kernel, boot) = boot_kernel();
        let first = ExRegsRequest::local(LThreadNo(3))
            .with_ip(0x4000)
            .with_sp(0x8000)
            .with_pager(boot);
        kernel.lthread_ex_regs(boot, first).unwrap();

        let reply = kernel
            .lthread_ex_regs(boot, ExRegsRequest::local(LThreadNo(3)).with_ip(0x5000))
            .unwrap();
        assert_eq!(reply.old_ip, UserIp::Valid(0x4000));
        assert_eq!(reply.old_sp, 0x8000);
        assert_eq!(reply.old_pager, boot);

        // Pager and sp were left alone
        let thread = kernel.thread(boot.with_lthread(LThreadNo(3))).unwrap();
        assert_eq!(thread.user_sp(), 0x8000);
        assert_eq!(thread.pager(), Some(boot));
    }

    #[test]
    fn test_kernel_ip_is_reported_as_above_split() {
        let (kernel, boot) = boot_kernel();
        let high = ExRegsRequest::local(LThreadNo(3)).with_ip(0xc000_1000);
        kernel.lthread_ex_regs(boot, high).unwrap();

        let reply = kernel
            .lthread_ex_regs(boot, ExRegsRequest::local(LThreadNo(3)))
            .unwrap();
        assert_eq!(reply.old_ip, UserIp::AboveUserSplit);
    }

    #[test]
    fn test_out_of_range_lthread() {
        let (kernel, boot) = boot_kernel();
        let request = ExRegsRequest::local(LThreadNo(200));
        assert!(matches!(
            kernel.lthread_ex_regs(boot, request),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_handler_ids_are_ignored() {
        let (kernel, boot) = boot_kernel();
        let request = ExRegsRequest::local(LThreadNo(3))
            .with_pager(ThreadId::main(TaskNo(77)))
            .with_preempter(boot);
        kernel.lthread_ex_regs(boot, request).unwrap();

        let thread = kernel.thread(boot.with_lthread(LThreadNo(3))).unwrap();
        assert_eq!(thread.pager(), None);
        assert_eq!(thread.preemption_receiver(), Some(boot));
    }

    #[test]
    fn test_pager_may_reach_into_task() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));

        let request = ExRegsRequest::inter_task(TaskNo(5), LThreadNo(1)).with_ip(0x1000);
        kernel.lthread_ex_regs(boot, request).unwrap();

        let worker = kernel.thread(child.with_lthread(LThreadNo(1))).unwrap();
        assert!(worker.is_ready());
        assert_eq!(worker.id().nest, 1);
    }

    #[test]
    fn test_stranger_is_rejected_and_logged() {
        let (kernel, boot) = boot_kernel();
        let victim = spawn_task(&kernel, boot, TaskNo(5));
        let stranger = spawn_task(&kernel, boot, TaskNo(6));

        let request = ExRegsRequest::inter_task(TaskNo(5), LThreadNo(0)).with_ip(0x6666);
        assert_eq!(
            kernel.lthread_ex_regs(stranger, request),
            Err(KernelError::NotFaultHandler {
                caller: TaskNo(6),
                task: TaskNo(5)
            })
        );

        assert_ne!(kernel.thread(victim).unwrap().user_ip(), 0x6666);
        assert_eq!(kernel.thread(victim).unwrap().lock_owner(), None);
        assert!(kernel.has_security_event(|e| matches!(
            e,
            SecurityEvent::ExRegsDenied { caller, .. } if caller.task == TaskNo(6)
        )));
    }

    #[test]
    fn test_dead_main_thread_is_not_locked() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(5));
        kernel.with_cpu_lock(|s| {
            if let Some(main) = s.threads.get_mut(&child.key()) {
                main.state_add(ThreadState::DEAD);
            }
        });

        let request = ExRegsRequest::inter_task(TaskNo(5), LThreadNo(1)).with_ip(0x1000);
        assert_eq!(
            kernel.lthread_ex_regs(boot, request),
            Err(KernelError::NotFound(ThreadId::main(TaskNo(5))))
        );
        assert_eq!(kernel.thread(child).unwrap().lock_owner(), None);
        assert!(kernel.thread(child.with_lthread(LThreadNo(1))).is_none());
    }

    #[test]
    fn test_cap_handler_task_is_accepted() {
        let (kernel, boot) = boot_kernel();
        let handler = spawn_task(&kernel, boot, TaskNo(6));
        let victim = spawn_task(&kernel, boot, TaskNo(5));
        kernel
            .lthread_ex_regs(
                boot,
                ExRegsRequest::inter_task(TaskNo(5), LThreadNo(0)).with_cap_handler(handler),
            )
            .unwrap();

        let request = ExRegsRequest::inter_task(TaskNo(5), LThreadNo(0)).with_sp(0x7000);
        kernel.lthread_ex_regs(handler, request).unwrap();
        assert_eq!(kernel.thread(victim).unwrap().user_sp(), 0x7000);
    }

    #[test]
    fn test_locked_variant_keeps_lock() {
        let (kernel, boot) = boot_kernel();
        let request = ExRegsRequest::local(LThreadNo(2)).with_flags(ExRegsFlags::NO_CANCEL);
        let (_, guard) = kernel.lthread_ex_regs_locked(boot, request).unwrap();
        let target = guard.target();

        assert_eq!(kernel.thread(target).unwrap().lock_owner(), Some(boot));
        drop(guard);
        assert_eq!(kernel.thread(target).unwrap().lock_owner(), None);
    }
}
