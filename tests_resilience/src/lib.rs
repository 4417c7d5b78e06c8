//! Resilience Test Utilities
//!
//! This crate provides shared utilities for resilience and integration tests.
//!
//! ## Test Philosophy
//!
//! - **Safety under races**: Slots, chiefs and quotas stay consistent when
//!   creators collide
//! - **Deterministic failures**: Planned races are reproducible via `RacePlan`
//! - **No authority leaks**: Only chiefs create tasks, only fault handlers
//!   reach into foreign threads
//! - **Timeliness**: Periodic threads see every period boundary

use core_types::{TaskNo, ThreadId};
use kernel_api::{Duration, KernelApi, KernelError, ScheduleVerb, TaskNewRequest};
use log::debug;
use sim_kernel::test_utils::{boot_kernel, spawn_task};
use sim_kernel::SimulatedKernel;
use std::collections::BTreeMap;

/// Bootstrap helper for tests
///
/// Boots a kernel with the default configuration and returns it together
/// with its boot thread.
pub fn test_bootstrap() -> (SimulatedKernel, ThreadId) {
    boot_kernel()
}

/// Hands the empty `slot` from its current chief to `new_chief`
pub fn transfer_slot(
    kernel: &SimulatedKernel,
    chief: ThreadId,
    slot: TaskNo,
    new_chief: TaskNo,
) -> Result<ThreadId, KernelError> {
    let reply = kernel.task_new(chief, TaskNewRequest::transfer(slot, new_chief))?;
    Ok(reply.id())
}

/// Builds a clan tree below the boot task
///
/// `edges` lists `(chief, subtask)` pairs in creation order; every chief
/// must be the boot task or a subtask created by an earlier edge. Returns
/// thread 0 of every task, boot task included.
pub fn build_clan_tree(
    kernel: &SimulatedKernel,
    boot: ThreadId,
    edges: &[(TaskNo, TaskNo)],
) -> Result<BTreeMap<TaskNo, ThreadId>, KernelError> {
    let mut members = BTreeMap::from([(boot.task, boot)]);
    for &(chief, subtask) in edges {
        let creator = members
            .get(&chief)
            .copied()
            .ok_or(KernelError::TaskNotFound(chief))?;
        if chief != boot.task {
            transfer_slot(kernel, boot, subtask, chief)?;
        }
        let id = spawn_task(kernel, creator, subtask);
        debug!("clan tree: {} under {}", id, chief);
        members.insert(subtask, id);
    }
    Ok(members)
}

/// Verbs that put a thread into periodic mode with one real-time slice
pub fn periodic_setup(prio: u8, budget: Duration, period: Duration, strict: bool) -> [ScheduleVerb; 3] {
    [
        ScheduleVerb::AddRealtime {
            prio,
            time: Some(budget),
        },
        ScheduleVerb::SetPeriod { period },
        ScheduleVerb::BeginPeriodic { clock: 0, strict },
    ]
}

/// Applies `verbs` to `dest` in order
pub fn apply_verbs(
    kernel: &SimulatedKernel,
    caller: ThreadId,
    dest: ThreadId,
    verbs: &[ScheduleVerb],
) -> Result<(), KernelError> {
    for &verb in verbs {
        kernel.thread_schedule(caller, dest, verb, ThreadId::INVALID)?;
    }
    Ok(())
}
