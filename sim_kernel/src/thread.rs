//! Thread control blocks

use crate::sched_context::{SchedContext, SchedRing};
use bitflags::bitflags;
use core_types::{ThreadId, ThreadKey};
use kernel_api::{Duration, ExRegsFlags, ExternalState, Prio};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

bitflags! {
    /// Run state of a thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ThreadState: u32 {
        const READY = 1 << 0;
        /// Waiting to send
        const POLLING = 1 << 1;
        /// Waiting to receive
        const RECEIVING = 1 << 2;
        const DEAD = 1 << 3;
        /// IPC postponed until the next period
        const DELAYED_IPC = 1 << 4;
        /// Waiting for the next period to begin
        const DELAYED_DEADLINE = 1 << 5;
        /// Ongoing operation was cancelled
        const CANCEL = 1 << 6;
        const IPC_IN_PROGRESS = 1 << 7;
        const IN_EXCEPTION = 1 << 8;
        const ALIEN = 1 << 9;
        const DIS_ALIEN = 1 << 10;
    }
}

/// Scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedMode {
    Timesharing,
    Periodic { strict: bool },
}

impl SchedMode {
    pub fn is_periodic(&self) -> bool {
        matches!(self, SchedMode::Periodic { .. })
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, SchedMode::Periodic { strict: true })
    }
}

/// Register and handler updates applied by [`Thread::initialize`]
///
/// `None` leaves the value untouched. Handler ids must already be resolved
/// to existing threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Initialization {
    pub ip: Option<u64>,
    pub sp: Option<u64>,
    pub pager: Option<ThreadId>,
    pub preempter: Option<ThreadId>,
    pub cap_handler: Option<ThreadId>,
    pub flags: ExRegsFlags,
}

/// Values a thread had before [`Thread::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousRegisters {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub pager: Option<ThreadId>,
    pub preempter: Option<ThreadId>,
    pub cap_handler: Option<ThreadId>,
}

/// A thread
#[derive(Debug, Clone)]
pub struct Thread {
    id: ThreadId,
    incarnation: Uuid,
    state: ThreadState,
    ring: SchedRing,
    mode: SchedMode,
    period: Duration,
    mcp: Prio,
    small_space: u8,
    /// Receives timeslice-expiry notifications (set by `thread_schedule`)
    ext_preempter: Option<ThreadId>,
    /// Receives preemption IPC (set by ex_regs)
    preemption_receiver: Option<ThreadId>,
    pager: Option<ThreadId>,
    cap_handler: Option<ThreadId>,
    consumed: Duration,
    user_ip: u64,
    user_sp: u64,
    user_flags: u64,
    partner: Option<ThreadId>,
    lock_owner: Option<ThreadId>,
    exception_pending: bool,
    preemption_pending: bool,
    deadline_misses: u64,
}

impl Thread {
    /// Creates a thread that exists but is not yet runnable
    ///
    /// The thread stays DEAD until its first `initialize`.
    pub fn new(id: ThreadId, incarnation: Uuid, prio: Prio, mcp: Prio, quantum: Duration) -> Self {
        Self {
            id,
            incarnation,
            state: ThreadState::DEAD,
            ring: SchedRing::new(prio, quantum),
            mode: SchedMode::Timesharing,
            period: Duration::ZERO,
            mcp,
            small_space: 0,
            ext_preempter: None,
            preemption_receiver: None,
            pager: None,
            cap_handler: None,
            consumed: Duration::ZERO,
            user_ip: 0,
            user_sp: 0,
            user_flags: 0,
            partner: None,
            lock_owner: None,
            exception_pending: false,
            preemption_pending: false,
            deadline_misses: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn key(&self) -> ThreadKey {
        self.id.key()
    }

    /// Incarnation of the owning task
    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.contains(ThreadState::READY)
    }

    pub fn is_dead(&self) -> bool {
        self.state.contains(ThreadState::DEAD)
    }

    pub fn state_add(&mut self, bits: ThreadState) {
        self.state.insert(bits);
    }

    pub fn state_del(&mut self, bits: ThreadState) {
        self.state.remove(bits);
    }

    /// Clears `clear`, then sets `set`
    pub fn state_change(&mut self, clear: ThreadState, set: ThreadState) {
        self.state.remove(clear);
        self.state.insert(set);
    }

    pub fn ring(&self) -> &SchedRing {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut SchedRing {
        &mut self.ring
    }

    /// Home (timesharing) slice
    pub fn sched_context(&self) -> &SchedContext {
        self.ring.home()
    }

    /// Slice the thread is currently scheduled on
    pub fn sched(&self) -> &SchedContext {
        self.ring.active()
    }

    pub fn mode(&self) -> SchedMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SchedMode) {
        self.mode = mode;
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn mcp(&self) -> Prio {
        self.mcp
    }

    pub(crate) fn set_mcp(&mut self, mcp: Prio) {
        self.mcp = mcp;
    }

    pub fn small_space(&self) -> u8 {
        self.small_space
    }

    pub fn set_small_space(&mut self, small_space: u8) {
        self.small_space = small_space;
    }

    pub fn ext_preempter(&self) -> Option<ThreadId> {
        self.ext_preempter
    }

    pub fn set_ext_preempter(&mut self, preempter: ThreadId) {
        self.ext_preempter = Some(preempter);
    }

    pub fn preemption_receiver(&self) -> Option<ThreadId> {
        self.preemption_receiver
    }

    pub fn pager(&self) -> Option<ThreadId> {
        self.pager
    }

    pub fn cap_handler(&self) -> Option<ThreadId> {
        self.cap_handler
    }

    pub fn consumed_time(&self) -> Duration {
        self.consumed
    }

    pub fn account(&mut self, delta: Duration) {
        self.consumed += delta;
    }

    pub fn user_ip(&self) -> u64 {
        self.user_ip
    }

    pub fn user_sp(&self) -> u64 {
        self.user_sp
    }

    pub fn user_flags(&self) -> u64 {
        self.user_flags
    }

    pub fn partner(&self) -> Option<ThreadId> {
        self.partner
    }

    pub fn set_partner(&mut self, partner: Option<ThreadId>) {
        self.partner = partner;
    }

    pub fn lock_owner(&self) -> Option<ThreadId> {
        self.lock_owner
    }

    pub(crate) fn set_lock_owner(&mut self, owner: Option<ThreadId>) {
        self.lock_owner = owner;
    }

    pub fn exception_pending(&self) -> bool {
        self.exception_pending
    }

    pub fn preemption_pending(&self) -> bool {
        self.preemption_pending
    }

    pub(crate) fn set_preemption_pending(&mut self, pending: bool) {
        self.preemption_pending = pending;
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    pub(crate) fn record_deadline_miss(&mut self) {
        self.deadline_misses += 1;
    }

    /// Run state as reported by `thread_schedule`
    pub fn external_state(&self) -> ExternalState {
        let s = self.state;
        if s.contains(ThreadState::DEAD) {
            ExternalState::Dead
        } else if s.contains(ThreadState::POLLING) {
            if s.contains(ThreadState::READY) {
                ExternalState::ReadyInIpc
            } else {
                ExternalState::Polling
            }
        } else if s.contains(ThreadState::RECEIVING) {
            if s.contains(ThreadState::READY) {
                ExternalState::ReadyInIpc
            } else {
                ExternalState::Receiving
            }
        } else {
            ExternalState::Other
        }
    }

    /// IPC partner, reported only while sending or receiving
    pub fn ipc_partner(&self) -> Option<ThreadId> {
        if self
            .state
            .intersects(ThreadState::POLLING | ThreadState::RECEIVING)
        {
            self.partner
        } else {
            None
        }
    }

    /// Applies new registers and handlers, returning the previous values
    ///
    /// A dead thread is resurrected. Otherwise any ongoing IPC is cancelled
    /// unless `NO_CANCEL` is given. `NO_CANCEL` on a thread inside an
    /// exception only swaps the handlers and leaves registers alone.
    pub fn initialize(&mut self, init: &Initialization) -> PreviousRegisters {
        let previous = PreviousRegisters {
            ip: self.user_ip,
            sp: self.user_sp,
            flags: self.user_flags,
            pager: self.pager,
            preempter: self.preemption_receiver,
            cap_handler: self.cap_handler,
        };

        if let Some(pager) = init.pager {
            self.pager = Some(pager);
        }
        if let Some(preempter) = init.preempter {
            self.preemption_receiver = Some(preempter);
        }
        if let Some(cap_handler) = init.cap_handler {
            self.cap_handler = Some(cap_handler);
        }

        let no_cancel = init.flags.contains(ExRegsFlags::NO_CANCEL);
        if no_cancel && self.state.contains(ThreadState::IN_EXCEPTION) {
            return previous;
        }

        if self.state.contains(ThreadState::DEAD) {
            self.state_change(ThreadState::DEAD, ThreadState::READY);
        } else if !no_cancel {
            self.state_change(
                ThreadState::IPC_IN_PROGRESS
                    | ThreadState::DELAYED_DEADLINE
                    | ThreadState::DELAYED_IPC,
                ThreadState::CANCEL | ThreadState::READY,
            );
        }

        if init.flags.contains(ExRegsFlags::TRIGGER_EXCEPTION) {
            self.exception_pending = true;
        }

        if let Some(ip) = init.ip {
            self.user_ip = ip;
            if init.flags.contains(ExRegsFlags::ALIEN) {
                self.state_change(ThreadState::DIS_ALIEN, ThreadState::ALIEN);
            } else {
                self.state_del(ThreadState::ALIEN);
            }
        }

        if let Some(sp) = init.sp {
            self.user_sp = sp;
        }

        previous
    }
}
