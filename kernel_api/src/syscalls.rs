//! Request and reply types of the scheduling and task-control syscalls.
//!
//! Raw register encodings are platform specific and not modelled here. Each
//! syscall takes a typed request and returns a typed reply; the all-ones
//! failure words of the register ABI become [`crate::KernelError`] values.

use crate::Duration;
use bitflags::bitflags;
use core_types::{LThreadNo, TaskNo, ThreadId};
use serde::{Deserialize, Serialize};

/// Scheduling priority (0 = lowest)
pub type Prio = u8;

/// Timeslice id; 0 is the permanent home slice
pub type SliceId = u16;

/// One `thread_schedule` operation
///
/// Variants carry exactly the fields their operation reads. The numeric
/// mode each variant replaces is available through [`ScheduleVerb::mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleVerb {
    /// Read the timesharing parameters without changing them
    Query,
    /// Set priority and quantum of the home slice
    SetTimesharing {
        prio: Prio,
        /// `None` keeps the current quantum
        time: Option<Duration>,
        /// Opaque small-address-space number, stored as given
        small_space: u8,
    },
    /// Append a real-time slice in front of the home slice
    AddRealtime { prio: Prio, time: Option<Duration> },
    /// Delete every real-time slice
    RemoveRealtime,
    /// Set the period length used by periodic mode
    SetPeriod { period: Duration },
    /// Enter periodic mode at `clock` (0 = now)
    BeginPeriodic { clock: u64, strict: bool },
    /// Return to timesharing
    EndPeriodic,
    /// Modify an existing slice (id 0 addresses the home slice)
    ChangeRealtime {
        id: SliceId,
        prio: Prio,
        time: Option<Duration>,
    },
}

impl ScheduleVerb {
    /// Register-ABI mode number, `None` for a plain query
    pub fn mode(&self) -> Option<u8> {
        match self {
            ScheduleVerb::Query => None,
            ScheduleVerb::SetTimesharing { .. } => Some(0),
            ScheduleVerb::AddRealtime { .. } => Some(1),
            ScheduleVerb::RemoveRealtime => Some(2),
            ScheduleVerb::SetPeriod { .. } => Some(3),
            ScheduleVerb::BeginPeriodic { strict: true, .. } => Some(4),
            ScheduleVerb::BeginPeriodic { strict: false, .. } => Some(5),
            ScheduleVerb::EndPeriodic => Some(6),
            ScheduleVerb::ChangeRealtime { .. } => Some(7),
        }
    }

    /// Priority requested by the verb, if it sets one
    pub fn prio(&self) -> Option<Prio> {
        match self {
            ScheduleVerb::SetTimesharing { prio, .. }
            | ScheduleVerb::AddRealtime { prio, .. }
            | ScheduleVerb::ChangeRealtime { prio, .. } => Some(*prio),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScheduleVerb::Query => "Query",
            ScheduleVerb::SetTimesharing { .. } => "SetTimesharing",
            ScheduleVerb::AddRealtime { .. } => "AddRealtime",
            ScheduleVerb::RemoveRealtime => "RemoveRealtime",
            ScheduleVerb::SetPeriod { .. } => "SetPeriod",
            ScheduleVerb::BeginPeriodic { .. } => "BeginPeriodic",
            ScheduleVerb::EndPeriodic => "EndPeriodic",
            ScheduleVerb::ChangeRealtime { .. } => "ChangeRealtime",
        }
    }
}

/// Externally visible run state reported by `thread_schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalState {
    /// Running, ready, or waiting on something other than IPC
    Other,
    /// Inside an IPC operation but ready
    ReadyInIpc,
    /// Waiting to receive
    Receiving,
    /// Waiting to send
    Polling,
    Dead,
}

impl ExternalState {
    /// Four-bit state code of the register ABI
    pub fn code(&self) -> u8 {
        match self {
            ExternalState::Other => 0x0,
            ExternalState::ReadyInIpc => 0x8,
            ExternalState::Receiving => 0xc,
            ExternalState::Polling => 0xd,
            ExternalState::Dead => 0xf,
        }
    }
}

/// Timesharing parameters of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimesharingParam {
    pub prio: Prio,
    pub quantum: Duration,
    pub state: ExternalState,
}

/// Snapshot returned by the query and timesharing verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadScheduleReply {
    pub old_param: TimesharingParam,
    pub old_preempter: ThreadId,
    pub partner: ThreadId,
    pub consumed_time: Duration,
}

/// Result of `thread_schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleReply {
    /// Query / set-timesharing: previous parameters
    Timesharing(ThreadScheduleReply),
    /// Any other verb succeeded
    Applied,
}

/// Result of `thread_switch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSwitchReply {
    /// Time left on the timeslice that was given up
    pub left: Duration,
}

bitflags! {
    /// Modifier bits of `lthread_ex_regs` and `task_new`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExRegsFlags: u8 {
        /// Do not cancel an ongoing IPC
        const NO_CANCEL = 1 << 0;
        /// Run the thread as an alien (syscalls become exceptions)
        const ALIEN = 1 << 1;
        /// Raise an exception in the thread
        const TRIGGER_EXCEPTION = 1 << 2;
    }
}

/// `lthread_ex_regs` request
///
/// `None` for ip/sp and a nil/invalid id for pager, preempter and cap
/// handler mean "leave unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExRegsRequest {
    /// Destination task; `None` (or the caller's own task) is a local request
    pub task: Option<TaskNo>,
    pub lthread: LThreadNo,
    pub ip: Option<u64>,
    pub sp: Option<u64>,
    pub pager: ThreadId,
    pub preempter: ThreadId,
    pub cap_handler: ThreadId,
    pub flags: ExRegsFlags,
}

impl ExRegsRequest {
    /// Request against a thread of the caller's own task
    pub fn local(lthread: LThreadNo) -> Self {
        Self {
            task: None,
            lthread,
            ip: None,
            sp: None,
            pager: ThreadId::INVALID,
            preempter: ThreadId::INVALID,
            cap_handler: ThreadId::INVALID,
            flags: ExRegsFlags::empty(),
        }
    }

    /// Request against a thread of another task
    pub fn inter_task(task: TaskNo, lthread: LThreadNo) -> Self {
        Self {
            task: Some(task),
            ..Self::local(lthread)
        }
    }

    pub fn with_ip(mut self, ip: u64) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_sp(mut self, sp: u64) -> Self {
        self.sp = Some(sp);
        self
    }

    pub fn with_pager(mut self, pager: ThreadId) -> Self {
        self.pager = pager;
        self
    }

    pub fn with_preempter(mut self, preempter: ThreadId) -> Self {
        self.preempter = preempter;
        self
    }

    pub fn with_cap_handler(mut self, cap_handler: ThreadId) -> Self {
        self.cap_handler = cap_handler;
        self
    }

    pub fn with_flags(mut self, flags: ExRegsFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Previous user instruction pointer as reported by `lthread_ex_regs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserIp {
    Valid(u64),
    /// The thread was executing at or above the user/kernel split
    AboveUserSplit,
}

/// Previous register and handler values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExRegsReply {
    pub old_ip: UserIp,
    pub old_sp: u64,
    pub old_pager: ThreadId,
    pub old_preempter: ThreadId,
    pub old_cap_handler: ThreadId,
    pub old_flags: u64,
}

/// Flexible page: `2^order` bytes starting at `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fpage {
    pub base: u64,
    pub order: u8,
}

impl Fpage {
    pub fn new(base: u64, order: u8) -> Self {
        Self { base, order }
    }

    pub fn size(&self) -> u64 {
        1u64.checked_shl(self.order as u32).unwrap_or(u64::MAX)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size())
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

bitflags! {
    /// Options of `fpage_unmap`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UnmapFlags: u8 {
        /// Only query (and possibly reset) status bits
        const NO_UNMAP = 1 << 0;
        /// Revoke write access only
        const DOWNGRADE = 1 << 1;
        /// Clear referenced/dirty bits
        const RESET_REFERENCES = 1 << 2;
        /// Also unmap from the caller's own space
        const SELF_UNMAP = 1 << 3;
    }
}

bitflags! {
    /// Rights and status bits exchanged with the mapping database
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UnmapRights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const REFERENCED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

bitflags! {
    /// Status returned by `fpage_unmap`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct UnmapStatus: u8 {
        const REFERENCED = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

/// `fpage_unmap` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmapRequest {
    pub fpage: Fpage,
    pub flags: UnmapFlags,
    /// Restrict revocation to mappings in this task
    pub restricted: Option<TaskNo>,
}

impl UnmapRequest {
    pub fn new(fpage: Fpage, flags: UnmapFlags) -> Self {
        Self {
            fpage,
            flags,
            restricted: None,
        }
    }

    pub fn restricted_to(mut self, task: TaskNo) -> Self {
        self.restricted = Some(task);
        self
    }
}

/// Relationship between caller and destination in the clan tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClanRelation {
    SameClan,
    InnerClan,
    OuterClan,
}

impl ClanRelation {
    /// Register-ABI type code
    pub fn code(&self) -> u8 {
        match self {
            ClanRelation::SameClan => 0x00,
            ClanRelation::InnerClan => 0x0c,
            ClanRelation::OuterClan => 0x04,
        }
    }
}

/// Result of `id_nearest`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nearest {
    pub id: ThreadId,
    pub relation: ClanRelation,
}

/// Where the memory budget of a new task comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaDescriptor {
    /// Use the creator's own quota
    Inherit,
    /// Share the quota of `task` (the caller itself or one of its subtasks)
    Share { task: TaskNo },
    /// Carve `max` bytes out of the quota of `task`
    New { task: TaskNo, max: u64 },
}

/// Parameters of a freshly created task and its thread 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub quota: QuotaDescriptor,
    pub ip: u64,
    pub sp: u64,
    pub pager: ThreadId,
    pub mcp: Prio,
    pub cap_handler: ThreadId,
    /// Only `ALIEN` and `TRIGGER_EXCEPTION` are honoured
    pub flags: ExRegsFlags,
}

impl TaskSpec {
    pub fn new(ip: u64, sp: u64, pager: ThreadId) -> Self {
        Self {
            quota: QuotaDescriptor::Inherit,
            ip,
            sp,
            pager,
            mcp: Prio::MAX,
            cap_handler: ThreadId::INVALID,
            flags: ExRegsFlags::empty(),
        }
    }

    pub fn with_quota(mut self, quota: QuotaDescriptor) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_mcp(mut self, mcp: Prio) -> Self {
        self.mcp = mcp;
        self
    }

    pub fn with_cap_handler(mut self, cap_handler: ThreadId) -> Self {
        self.cap_handler = cap_handler;
        self
    }

    pub fn with_flags(mut self, flags: ExRegsFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// What `task_new` should do with the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskNewKind {
    /// Create a task with a running thread 0
    Create(TaskSpec),
    /// Hand the (empty) slot over to another chief
    TransferChief { new_chief: TaskNo },
}

/// `task_new` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNewRequest {
    pub task: TaskNo,
    pub kind: TaskNewKind,
}

impl TaskNewRequest {
    pub fn create(task: TaskNo, spec: TaskSpec) -> Self {
        Self {
            task,
            kind: TaskNewKind::Create(spec),
        }
    }

    pub fn transfer(task: TaskNo, new_chief: TaskNo) -> Self {
        Self {
            task,
            kind: TaskNewKind::TransferChief { new_chief },
        }
    }
}

/// Result of `task_new`
///
/// A created task comes back with the lock of its thread 0 still held, so
/// the creator can adjust the thread before anyone else sees it.
#[derive(Debug)]
#[must_use = "dropping the reply releases the new thread's lock"]
pub enum TaskNewReply<G> {
    Created { id: ThreadId, guard: G },
    Transferred { id: ThreadId },
}

impl<G> TaskNewReply<G> {
    /// Id of thread 0 of the slot
    pub fn id(&self) -> ThreadId {
        match self {
            TaskNewReply::Created { id, .. } | TaskNewReply::Transferred { id } => *id,
        }
    }

    /// Takes the lock guard of a created task
    pub fn into_guard(self) -> Option<G> {
        match self {
            TaskNewReply::Created { guard, .. } => Some(guard),
            TaskNewReply::Transferred { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_modes() {
        assert_eq!(ScheduleVerb::Query.mode(), None);
        assert_eq!(
            ScheduleVerb::BeginPeriodic {
                clock: 0,
                strict: true
            }
            .mode(),
            Some(4)
        );
        assert_eq!(
            ScheduleVerb::BeginPeriodic {
                clock: 0,
                strict: false
            }
            .mode(),
            Some(5)
        );
        assert_eq!(
            ScheduleVerb::ChangeRealtime {
                id: 1,
                prio: 3,
                time: None
            }
            .mode(),
            Some(7)
        );
    }

    #[test]
    fn test_verb_prio_only_for_prio_verbs() {
        assert_eq!(ScheduleVerb::EndPeriodic.prio(), None);
        assert_eq!(
            ScheduleVerb::AddRealtime {
                prio: 9,
                time: None
            }
            .prio(),
            Some(9)
        );
    }

    #[test]
    fn test_external_state_codes() {
        assert_eq!(ExternalState::Dead.code(), 0xf);
        assert_eq!(ExternalState::Polling.code(), 0xd);
        assert_eq!(ExternalState::Receiving.code(), 0xc);
        assert_eq!(ExternalState::ReadyInIpc.code(), 0x8);
    }

    #[test]
    fn test_fpage_bounds() {
        let fp = Fpage::new(0x4000, 12);
        assert_eq!(fp.size(), 0x1000);
        assert!(fp.contains(0x4fff));
        assert!(!fp.contains(0x5000));
        assert_eq!(Fpage::new(0, 64).size(), u64::MAX);
    }

    #[test]
    fn test_ex_regs_builder_defaults_keep_values() {
        let req = ExRegsRequest::inter_task(TaskNo(7), LThreadNo(1)).with_ip(0x1000);
        assert_eq!(req.task, Some(TaskNo(7)));
        assert_eq!(req.ip, Some(0x1000));
        assert_eq!(req.sp, None);
        assert!(req.pager.is_invalid());
    }

    #[test]
    fn test_task_new_reply_guard() {
        let reply: TaskNewReply<u32> = TaskNewReply::Created {
            id: ThreadId::main(TaskNo(5)),
            guard: 7,
        };
        assert_eq!(reply.id(), ThreadId::main(TaskNo(5)));
        assert_eq!(reply.into_guard(), Some(7));

        let reply: TaskNewReply<u32> = TaskNewReply::Transferred {
            id: ThreadId::main(TaskNo(5)),
        };
        assert_eq!(reply.into_guard(), None);
    }

    #[test]
    fn test_flags_serde() {
        let flags = ExRegsFlags::ALIEN | ExRegsFlags::NO_CANCEL;
        let json = serde_json::to_string(&flags).unwrap();
        let back: ExRegsFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
