//! Kernel error types
//!
//! Every syscall either completes or fails synchronously with one of these.
//! Failures never leave partial effects behind.

use core_types::{TaskNo, ThreadId};
use resources::QuotaError;
use thiserror::Error;

/// Errors returned by the scheduling and task-control syscalls
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The calling thread does not exist (or is dead)
    #[error("Caller {0} is not a live thread")]
    InvalidCaller(ThreadId),

    /// Destination thread does not exist or its id is out of range
    #[error("{0} not found")]
    NotFound(ThreadId),

    /// Task slot is out of range or empty
    #[error("{0} not found")]
    TaskNotFound(TaskNo),

    /// Requested priority is above the maximum controlled priority
    #[error("Priority {prio} exceeds mcp {mcp}")]
    PriorityAboveMcp { prio: u8, mcp: u8 },

    /// The caller does not administer the task slot
    #[error("{caller} is not chief of {task}")]
    NotChief { caller: TaskNo, task: TaskNo },

    /// Inter-task ex_regs from a task that is neither pager nor cap handler
    #[error("Security violation: {caller} is not fault handler of {task}")]
    NotFaultHandler { caller: TaskNo, task: TaskNo },

    /// Periodic mode is active or about to begin
    #[error("Thread is in or transitioning to periodic mode")]
    AlreadyPeriodic,

    /// Periodic mode is neither active nor armed
    #[error("Thread is not in periodic mode")]
    NotPeriodic,

    /// Periodic start time lies before the current clock
    #[error("Clock {clock} lies in the past (now {now})")]
    ClockInPast { clock: u64, now: u64 },

    /// Operation requires the thread to run on its home timeslice
    #[error("Thread is not parked at its home timeslice")]
    NotAtHomeSlice,

    /// The invalid-time value was passed where a time is required
    #[error("Invalid time value")]
    InvalidTime,

    /// No timeslice with the given id
    #[error("No timeslice with id {0}")]
    SliceNotFound(u16),

    /// Timeslice ids are exhausted
    #[error("Timeslice table full")]
    TooManySlices,

    /// Quota accounting refused the allocation
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(#[from] QuotaError),

    /// Thread lock is held by another thread
    #[error("Lock of {target} is held by {holder}")]
    LockContended { target: ThreadId, holder: ThreadId },

    /// Someone else changed the chief of the slot first
    #[error("Chief transfer of {0} lost the race")]
    ChiefTransferLost(TaskNo),

    /// New chief would make the chief relation cyclic
    #[error("{new_chief} lies inside the subtree of {task}")]
    ChiefCycle { task: TaskNo, new_chief: TaskNo },

    /// Deleting the incumbent task of a slot failed
    #[error("Deletion of {0} failed")]
    KillFailed(TaskNo),

    /// Racing creators kept filling the slot
    #[error("Gave up after {0} attempts")]
    RetryLimitExceeded(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_converts() {
        let err: KernelError = QuotaError::Exhausted {
            requested: 10,
            available: 2,
        }
        .into();
        assert!(matches!(err, KernelError::QuotaExhausted(_)));
    }

    #[test]
    fn test_security_violation_message() {
        let err = KernelError::NotFaultHandler {
            caller: TaskNo(5),
            task: TaskNo(6),
        };
        assert!(err.to_string().starts_with("Security violation"));
    }
}
