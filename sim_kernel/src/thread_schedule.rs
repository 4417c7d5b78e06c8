//! Scheduling parameters and the periodic state machine
//!
//! A thread is either timesharing, or periodic. A periodic thread walks its
//! real-time slices once per period and is restarted at the first one when
//! the deadline timeout fires. Strict threads that are still inside their
//! real-time slices at that moment have missed the deadline.

use crate::preemption::PreemptionKind;
use crate::sched_context::round_quantum;
use crate::scheduler::ScheduleEvent;
use crate::thread::{SchedMode, ThreadState};
use crate::{KernelState, SimulatedKernel};
use core_types::{ThreadId, ThreadKey};
use kernel_api::{
    Duration, Instant, KernelError, Prio, ScheduleReply, ScheduleVerb, SliceId,
    ThreadScheduleReply, TimesharingParam,
};
use log::debug;

impl KernelState {
    fn round(&self, time: Duration) -> Duration {
        round_quantum(time, self.config.scheduler_granularity)
    }

    fn owner_mcp(&self, key: ThreadKey) -> Prio {
        self.threads
            .get(&key)
            .and_then(|t| t.lock_owner())
            .and_then(|owner| self.threads.get(&owner.key()))
            .map(|owner| owner.mcp())
            .unwrap_or(0)
    }

    fn periodic_or_armed(&self, key: ThreadKey) -> bool {
        let periodic = self
            .threads
            .get(&key)
            .map(|t| t.mode().is_periodic())
            .unwrap_or(false);
        periodic || self.timeouts.is_armed(key)
    }

    fn at_home(&self, key: ThreadKey) -> bool {
        self.threads
            .get(&key)
            .map(|t| t.ring().is_at_home())
            .unwrap_or(false)
    }

    /// Changes priority and, if given, quantum of an existing slice
    pub(crate) fn set_schedule_param(
        &mut self,
        key: ThreadKey,
        id: SliceId,
        prio: Prio,
        time: Option<Duration>,
    ) -> Result<(), KernelError> {
        let mcp = self.owner_mcp(key);
        if prio > mcp {
            return Err(KernelError::PriorityAboveMcp { prio, mcp });
        }
        let quantum = time.map(|t| self.round(t));

        let thread = self
            .threads
            .get_mut(&key)
            .ok_or(KernelError::NotFound(ThreadId::from(key)))?;
        let active_id = thread.sched().id();
        let slice = thread
            .ring_mut()
            .get_mut(id)
            .ok_or(KernelError::SliceNotFound(id))?;

        let is_active = slice.id() == active_id;
        if slice.prio() != prio {
            slice.set_prio(prio);
            if is_active {
                self.scheduler.ready.dequeue(key);
            }
        }
        if let Some(quantum) = quantum {
            slice.set_quantum(quantum);
            if !is_active {
                slice.set_left(quantum);
            }
        }
        Ok(())
    }

    pub(crate) fn set_realtime_param(
        &mut self,
        key: ThreadKey,
        prio: Prio,
        time: Option<Duration>,
    ) -> Result<SliceId, KernelError> {
        if self.periodic_or_armed(key) {
            return Err(KernelError::AlreadyPeriodic);
        }
        let mcp = self.owner_mcp(key);
        if prio > mcp {
            return Err(KernelError::PriorityAboveMcp { prio, mcp });
        }
        let quantum = self.round(time.ok_or(KernelError::InvalidTime)?);

        let thread = self
            .threads
            .get_mut(&key)
            .ok_or(KernelError::NotFound(ThreadId::from(key)))?;
        thread.ring_mut().add_realtime(prio, quantum)
    }

    pub(crate) fn remove_realtime_param(&mut self, key: ThreadKey) -> Result<usize, KernelError> {
        if self.periodic_or_armed(key) {
            return Err(KernelError::AlreadyPeriodic);
        }
        if !self.at_home(key) {
            return Err(KernelError::NotAtHomeSlice);
        }

        self.cancel_preemption(key);
        let removed = self
            .threads
            .get_mut(&key)
            .map(|t| t.ring_mut().remove_realtime())
            .unwrap_or(0);
        Ok(removed)
    }

    pub(crate) fn set_period(&mut self, key: ThreadKey, period: Duration) {
        let period = self.round(period);
        if let Some(thread) = self.threads.get_mut(&key) {
            thread.set_period(period);
        }
    }

    pub(crate) fn begin_periodic(
        &mut self,
        key: ThreadKey,
        clock: u64,
        strict: bool,
    ) -> Result<(), KernelError> {
        if self.periodic_or_armed(key) {
            return Err(KernelError::AlreadyPeriodic);
        }
        let now = self.clock.now();
        let start = if clock == 0 {
            now
        } else {
            Instant::from_micros(clock)
        };
        if start < now {
            return Err(KernelError::ClockInPast {
                clock,
                now: now.as_micros(),
            });
        }
        if !self.at_home(key) {
            return Err(KernelError::NotAtHomeSlice);
        }

        if let Some(thread) = self.threads.get_mut(&key) {
            thread.set_mode(SchedMode::Periodic { strict });
        }
        self.timeouts.arm(key, start);
        debug!("{} periodic from {} (strict: {})", key, start.as_micros(), strict);
        Ok(())
    }

    pub(crate) fn end_periodic(&mut self, key: ThreadKey) -> Result<(), KernelError> {
        if !self.periodic_or_armed(key) {
            return Err(KernelError::NotPeriodic);
        }

        if let Some(thread) = self.threads.get_mut(&key) {
            thread.set_mode(SchedMode::Timesharing);
        }
        if !self.at_home(key) {
            self.switch_sched(key, 0);
        }
        self.timeouts.cancel(key);

        if let Some(thread) = self.threads.get_mut(&key) {
            let state = thread.state();
            if state.contains(ThreadState::DELAYED_DEADLINE) {
                if state.contains(ThreadState::DELAYED_IPC) {
                    thread.state_del(ThreadState::DELAYED_DEADLINE);
                } else {
                    thread.state_change(ThreadState::DELAYED_DEADLINE, ThreadState::READY);
                }
            }
        }
        self.sync_ready(key);
        debug!("{} back to timesharing", key);
        Ok(())
    }

    /// Deadline timeout of a periodic thread fired at `at`
    pub(crate) fn deadline_expired(&mut self, key: ThreadKey, at: Instant) {
        let Some(thread) = self.threads.get_mut(&key) else {
            return;
        };

        let state = thread.state();
        let missed = if state.contains(ThreadState::DELAYED_DEADLINE) {
            thread.state_change(
                ThreadState::DELAYED_DEADLINE | ThreadState::DELAYED_IPC,
                ThreadState::READY,
            );
            false
        } else {
            thread.mode().is_strict() && !thread.ring().is_at_home() && thread.is_ready()
        };

        let slice = thread.sched().id();
        let first = thread.ring().first_realtime_index();
        let period = thread.period();

        if missed {
            thread.record_deadline_miss();
            self.scheduler.record(ScheduleEvent::DeadlineMissed {
                thread: key,
                deadline_micros: at.as_micros(),
                timestamp_micros: self.clock.now().as_micros(),
            });
            self.post_preemption(key, slice, PreemptionKind::DeadlineMissed);
        }

        self.switch_sched(key, first);
        if !period.is_zero() {
            self.timeouts.arm(key, at + period);
        }
        self.sync_ready(key);
    }

    /// Applies `verb` to a thread whose lock the caller holds
    fn apply_schedule_verb(
        &mut self,
        key: ThreadKey,
        verb: ScheduleVerb,
        preempter: ThreadId,
    ) -> Result<ScheduleReply, KernelError> {
        let snapshot = self.timesharing_snapshot(key)?;

        match verb {
            ScheduleVerb::Query => {}
            ScheduleVerb::SetTimesharing {
                prio,
                time,
                small_space,
            } => {
                self.set_schedule_param(key, 0, prio, time)?;
                if let Some(thread) = self.threads.get_mut(&key) {
                    thread.set_small_space(small_space);
                }
            }
            ScheduleVerb::ChangeRealtime { id, prio, time } => {
                self.set_schedule_param(key, id, prio, time)?;
                return Ok(ScheduleReply::Applied);
            }
            ScheduleVerb::AddRealtime { prio, time } => {
                self.set_realtime_param(key, prio, time)?;
                return Ok(ScheduleReply::Applied);
            }
            ScheduleVerb::RemoveRealtime => {
                self.remove_realtime_param(key)?;
                return Ok(ScheduleReply::Applied);
            }
            ScheduleVerb::SetPeriod { period } => {
                self.set_period(key, period);
                return Ok(ScheduleReply::Applied);
            }
            ScheduleVerb::BeginPeriodic { clock, strict } => {
                self.begin_periodic(key, clock, strict)?;
                return Ok(ScheduleReply::Applied);
            }
            ScheduleVerb::EndPeriodic => {
                self.end_periodic(key)?;
                return Ok(ScheduleReply::Applied);
            }
        }

        if self.lookup(preempter).is_some() {
            if let Some(thread) = self.threads.get_mut(&key) {
                thread.set_ext_preempter(preempter);
            }
        }
        Ok(ScheduleReply::Timesharing(snapshot))
    }

    fn timesharing_snapshot(&self, key: ThreadKey) -> Result<ThreadScheduleReply, KernelError> {
        let thread = self
            .threads
            .get(&key)
            .ok_or(KernelError::NotFound(ThreadId::from(key)))?;
        let home = thread.sched_context();

        let old_preempter = thread
            .ext_preempter()
            .and_then(|p| self.lookup(p))
            .map(|p| p.id())
            .unwrap_or(ThreadId::INVALID);

        Ok(ThreadScheduleReply {
            old_param: TimesharingParam {
                prio: home.prio(),
                quantum: home.quantum(),
                state: thread.external_state(),
            },
            old_preempter,
            partner: thread.ipc_partner().unwrap_or(ThreadId::INVALID),
            consumed_time: thread.consumed_time(),
        })
    }
}

impl SimulatedKernel {
    pub(crate) fn do_thread_schedule(
        &self,
        caller: ThreadId,
        dest: ThreadId,
        verb: ScheduleVerb,
        preempter: ThreadId,
    ) -> Result<ScheduleReply, KernelError> {
        let (me, target) = self.with_cpu_lock(|s| {
            let me = s.live_thread(caller)?.key();
            let target = s.lookup(dest).ok_or(KernelError::NotFound(dest))?.key();
            Ok::<_, KernelError>((me, target))
        })?;

        let _guard = self.lock_thread(ThreadId::from(me), ThreadId::from(target))?;

        self.with_cpu_lock(|s| {
            let mcp = s.threads.get(&me).map(|t| t.mcp()).unwrap_or(0);
            let home_prio = s
                .threads
                .get(&target)
                .map(|t| t.sched_context().prio())
                .ok_or(KernelError::NotFound(dest))?;
            if home_prio > mcp {
                return Err(KernelError::PriorityAboveMcp {
                    prio: home_prio,
                    mcp,
                });
            }
            s.apply_schedule_verb(target, verb, preempter)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{boot_kernel, spawn_thread};
    use core_types::LThreadNo;
    use kernel_api::{ExternalState, KernelApi};

    fn timesharing(prio: Prio) -> ScheduleVerb {
        ScheduleVerb::SetTimesharing {
            prio,
            time: None,
            small_space: 0,
        }
    }

    #[test]
    fn test_query_reports_home_slice() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));

        let reply = kernel
            .thread_schedule(boot, worker, ScheduleVerb::Query, ThreadId::INVALID)
            .unwrap();
        let ScheduleReply::Timesharing(reply) = reply else {
            panic!("query returns timesharing parameters");
        };
        assert_eq!(reply.old_param.prio, 0x10);
        assert_eq!(reply.old_param.quantum, Duration::from_millis(10));
        assert_eq!(reply.old_param.state, ExternalState::Other);
        assert_eq!(reply.old_preempter, ThreadId::INVALID);
        assert_eq!(reply.partner, ThreadId::INVALID);
    }

    #[test]
    fn test_set_timesharing_returns_old_values() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));

        let verb = ScheduleVerb::SetTimesharing {
            prio: 0x20,
            time: Some(Duration::from_micros(2_500)),
            small_space: 3,
        };
        let reply = kernel.thread_schedule(boot, worker, verb, boot).unwrap();
        let ScheduleReply::Timesharing(reply) = reply else {
            panic!("set-timesharing returns the old parameters");
        };
        assert_eq!(reply.old_param.prio, 0x10);

        let thread = kernel.thread(worker).unwrap();
        assert_eq!(thread.sched_context().prio(), 0x20);
        assert_eq!(thread.sched_context().quantum(), Duration::from_micros(3_000));
        assert_eq!(thread.small_space(), 3);
        assert_eq!(thread.ext_preempter(), Some(boot));
    }

    #[test]
    fn test_preempter_must_exist() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        let ghost = boot.with_lthread(LThreadNo(40));

        kernel
            .thread_schedule(boot, worker, ScheduleVerb::Query, ghost)
            .unwrap();
        assert_eq!(kernel.thread(worker).unwrap().ext_preempter(), None);
    }

    #[test]
    fn test_priority_above_mcp_leaves_target_unchanged() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        kernel.set_mcp_for_test(boot, 0x30);

        let err = kernel
            .thread_schedule(boot, worker, timesharing(0x31), ThreadId::INVALID)
            .unwrap_err();
        assert_eq!(err, KernelError::PriorityAboveMcp { prio: 0x31, mcp: 0x30 });
        assert_eq!(kernel.thread(worker).unwrap().sched_context().prio(), 0x10);
        assert_eq!(kernel.thread(worker).unwrap().lock_owner(), None);
    }

    #[test]
    fn test_target_above_caller_mcp_is_rejected() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        kernel
            .thread_schedule(boot, worker, timesharing(0x80), ThreadId::INVALID)
            .unwrap();
        kernel.set_mcp_for_test(boot, 0x40);

        assert!(matches!(
            kernel.thread_schedule(boot, worker, ScheduleVerb::Query, ThreadId::INVALID),
            Err(KernelError::PriorityAboveMcp { prio: 0x80, mcp: 0x40 })
        ));
    }

    #[test]
    fn test_missing_destination() {
        let (kernel, boot) = boot_kernel();
        let ghost = boot.with_lthread(LThreadNo(40));
        assert_eq!(
            kernel.thread_schedule(boot, ghost, ScheduleVerb::Query, ThreadId::INVALID),
            Err(KernelError::NotFound(ghost))
        );
    }

    #[test]
    fn test_add_and_remove_realtime_slices() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));

        for prio in [0x40, 0x50] {
            let verb = ScheduleVerb::AddRealtime {
                prio,
                time: Some(Duration::from_micros(1_200)),
            };
            assert_eq!(
                kernel.thread_schedule(boot, worker, verb, ThreadId::INVALID),
                Ok(ScheduleReply::Applied)
            );
        }
        {
            let thread = kernel.thread(worker).unwrap();
            assert_eq!(thread.ring().len(), 3);
            assert_eq!(thread.ring().get(2).unwrap().quantum(), Duration::from_micros(2_000));
        }

        kernel
            .thread_schedule(boot, worker, ScheduleVerb::RemoveRealtime, ThreadId::INVALID)
            .unwrap();
        assert_eq!(kernel.thread(worker).unwrap().ring().len(), 1);
    }

    #[test]
    fn test_add_realtime_needs_time() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        let verb = ScheduleVerb::AddRealtime { prio: 1, time: None };
        assert_eq!(
            kernel.thread_schedule(boot, worker, verb, ThreadId::INVALID),
            Err(KernelError::InvalidTime)
        );
    }

    #[test]
    fn test_change_unknown_slice() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        let verb = ScheduleVerb::ChangeRealtime {
            id: 4,
            prio: 1,
            time: None,
        };
        assert_eq!(
            kernel.thread_schedule(boot, worker, verb, ThreadId::INVALID),
            Err(KernelError::SliceNotFound(4))
        );
    }

    #[test]
    fn test_begin_in_the_past_is_rejected() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        kernel.advance_time(Duration::from_millis(5));

        let verb = ScheduleVerb::BeginPeriodic {
            clock: 1_000,
            strict: true,
        };
        assert_eq!(
            kernel.thread_schedule(boot, worker, verb, ThreadId::INVALID),
            Err(KernelError::ClockInPast {
                clock: 1_000,
                now: 5_000
            })
        );
    }

    #[test]
    fn test_begin_twice_and_end_without_begin() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        let begin = ScheduleVerb::BeginPeriodic {
            clock: 50_000,
            strict: false,
        };

        assert_eq!(
            kernel.thread_schedule(boot, worker, ScheduleVerb::EndPeriodic, ThreadId::INVALID),
            Err(KernelError::NotPeriodic)
        );
        kernel
            .thread_schedule(boot, worker, begin, ThreadId::INVALID)
            .unwrap();
        assert_eq!(
            kernel.thread_schedule(boot, worker, begin, ThreadId::INVALID),
            Err(KernelError::AlreadyPeriodic)
        );
        let add = ScheduleVerb::AddRealtime {
            prio: 1,
            time: Some(Duration::from_millis(1)),
        };
        assert_eq!(
            kernel.thread_schedule(boot, worker, add, ThreadId::INVALID),
            Err(KernelError::AlreadyPeriodic)
        );
    }

    #[test]
    fn test_deadline_restarts_ring_at_first_realtime_slice() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(1));
        let verbs = [
            ScheduleVerb::AddRealtime {
                prio: 0x40,
                time: Some(Duration::from_millis(2)),
            },
            ScheduleVerb::SetPeriod {
                period: Duration::from_millis(20),
            },
            ScheduleVerb::BeginPeriodic {
                clock: 0,
                strict: true,
            },
        ];
        for verb in verbs {
            kernel
                .thread_schedule(boot, worker, verb, ThreadId::INVALID)
                .unwrap();
        }

        kernel.advance_time(Duration::ZERO);
        let thread = kernel.thread(worker).unwrap();
        assert_eq!(thread.sched().id(), 1);
        assert_eq!(kernel.current_thread(), Some(worker.key()));
        assert_eq!(kernel.deadline_of(worker), Some(Instant::from_micros(20_000)));
    }
}
