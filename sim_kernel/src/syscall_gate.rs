//! Syscall gate for the user/kernel boundary.
//!
//! Every request a user thread makes of the scheduling and task-control
//! plane can be funnelled through [`SyscallGate::execute`], which dispatches
//! it to a [`KernelApi`] and keeps an audit trail of what happened.

use core_types::{ThreadId, TaskNo};
use kernel_api::{
    ExRegsReply, ExRegsRequest, KernelApi, KernelError, Nearest, ScheduleReply, ScheduleVerb,
    TaskNewRequest, ThreadSwitchReply, UnmapRequest, UnmapStatus,
};
use serde::{Deserialize, Serialize};

/// Complete syscall set of the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Syscall {
    ThreadSwitch {
        dest: ThreadId,
    },
    ThreadSchedule {
        dest: ThreadId,
        verb: ScheduleVerb,
        preempter: ThreadId,
    },
    ExRegs {
        request: ExRegsRequest,
    },
    FpageUnmap {
        request: UnmapRequest,
    },
    IdNearest {
        dest: ThreadId,
    },
    TaskNew {
        request: TaskNewRequest,
    },
}

impl Syscall {
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::ThreadSwitch { .. } => "ThreadSwitch",
            Syscall::ThreadSchedule { .. } => "ThreadSchedule",
            Syscall::ExRegs { .. } => "ExRegs",
            Syscall::FpageUnmap { .. } => "FpageUnmap",
            Syscall::IdNearest { .. } => "IdNearest",
            Syscall::TaskNew { .. } => "TaskNew",
        }
    }
}

/// Syscall result from the gate.
///
/// A task created through the gate is returned unlocked; callers that need
/// the lock of the new thread use [`KernelApi::task_new`] directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallResult {
    Switched(ThreadSwitchReply),
    Scheduled(ScheduleReply),
    Registers(ExRegsReply),
    Unmapped(UnmapStatus),
    Nearest(Nearest),
    Task(ThreadId),
}

/// Syscall audit event (for testing and verification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallEvent {
    /// Syscall was invoked
    Invoked {
        caller: ThreadId,
        syscall_name: String,
        timestamp_micros: u64,
    },
    /// Syscall completed successfully
    Completed {
        caller: ThreadId,
        syscall_name: String,
        timestamp_micros: u64,
    },
    /// Syscall was rejected
    Rejected {
        caller: ThreadId,
        syscall_name: String,
        reason: String,
        timestamp_micros: u64,
    },
    /// Caller tried to act on a task it has no authority over
    SecurityViolation {
        caller: ThreadId,
        task: TaskNo,
        timestamp_micros: u64,
    },
}

/// Audit log for syscall operations.
#[derive(Debug, Clone, Default)]
pub struct SyscallAuditLog {
    events: Vec<SyscallEvent>,
}

impl SyscallAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: SyscallEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SyscallEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

/// Syscall gate that records every crossing of the user/kernel boundary.
#[derive(Debug, Default)]
pub struct SyscallGate {
    /// Audit log for syscall operations
    audit_log: SyscallAuditLog,
}

impl SyscallGate {
    pub fn new() -> Self {
        Self {
            audit_log: SyscallAuditLog::new(),
        }
    }

    /// Returns the audit log (test-only)
    pub fn audit_log(&self) -> &SyscallAuditLog {
        &self.audit_log
    }

    /// Clears the audit log (test-only)
    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }

    /// Executes a syscall on behalf of `caller`.
    pub fn execute<K: KernelApi>(
        &mut self,
        kernel: &K,
        caller: ThreadId,
        syscall: Syscall,
    ) -> Result<SyscallResult, KernelError> {
        let syscall_name = syscall.name();
        let timestamp_micros = kernel.now().as_micros();

        self.audit_log.record(SyscallEvent::Invoked {
            caller,
            syscall_name: syscall_name.to_string(),
            timestamp_micros,
        });

        let result = match syscall {
            Syscall::ThreadSwitch { dest } => kernel
                .thread_switch(caller, dest)
                .map(SyscallResult::Switched),
            Syscall::ThreadSchedule {
                dest,
                verb,
                preempter,
            } => kernel
                .thread_schedule(caller, dest, verb, preempter)
                .map(SyscallResult::Scheduled),
            Syscall::ExRegs { request } => kernel
                .lthread_ex_regs(caller, request)
                .map(SyscallResult::Registers),
            Syscall::FpageUnmap { request } => kernel
                .fpage_unmap(caller, request)
                .map(SyscallResult::Unmapped),
            Syscall::IdNearest { dest } => kernel
                .id_nearest(caller, dest)
                .map(SyscallResult::Nearest),
            Syscall::TaskNew { request } => kernel.task_new(caller, request).map(|reply| {
                let id = reply.id();
                drop(reply);
                SyscallResult::Task(id)
            }),
        };

        let timestamp_micros = kernel.now().as_micros();
        match &result {
            Ok(_) => {
                self.audit_log.record(SyscallEvent::Completed {
                    caller,
                    syscall_name: syscall_name.to_string(),
                    timestamp_micros,
                });
            }
            Err(err) => {
                if let KernelError::NotFaultHandler { task, .. } | KernelError::NotChief { task, .. } =
                    err
                {
                    self.audit_log.record(SyscallEvent::SecurityViolation {
                        caller,
                        task: *task,
                        timestamp_micros,
                    });
                }
                self.audit_log.record(SyscallEvent::Rejected {
                    caller,
                    syscall_name: syscall_name.to_string(),
                    reason: err.to_string(),
                    timestamp_micros,
                });
            }
        }

        result
    }
}
