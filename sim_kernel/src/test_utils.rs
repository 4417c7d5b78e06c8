//! Test utilities for the simulated kernel
//!
//! Shorthands for the setup most tests share: a booted kernel, extra
//! threads in a task, and fresh subtasks.
//!
//! # Example
//!
//! ```
//! use sim_kernel::test_utils::{boot_kernel, spawn_task};
//! use core_types::TaskNo;
//!
//! let (kernel, boot) = boot_kernel();
//! let child = spawn_task(&kernel, boot, TaskNo(5));
//! assert_eq!(kernel.chief_of(TaskNo(5)), Some(boot.task));
//! assert_eq!(child.nest, 1);
//! ```

use crate::SimulatedKernel;
use core_types::{LThreadNo, TaskNo, ThreadId};
use kernel_api::{ExRegsRequest, KernelApi, TaskNewRequest, TaskSpec};

/// Routes `log` output through the test harness; safe to call repeatedly
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boots a kernel with the default configuration
///
/// Returns the kernel and its boot thread.
pub fn boot_kernel() -> (SimulatedKernel, ThreadId) {
    init_logging();
    let kernel = SimulatedKernel::new();
    let boot = kernel.boot_thread();
    (kernel, boot)
}

/// Creates thread `lthread` in the task of `owner`, paged by `owner`
///
/// # Panics
///
/// Panics if `lthread_ex_regs` fails.
pub fn spawn_thread(kernel: &SimulatedKernel, owner: ThreadId, lthread: LThreadNo) -> ThreadId {
    let base = 0x1000 * (lthread.0 as u64 + 1);
    let request = ExRegsRequest::local(lthread)
        .with_ip(base)
        .with_sp(base + 0x800)
        .with_pager(owner);
    if let Err(err) = kernel.lthread_ex_regs(owner, request) {
        panic!("spawning {:?} in {}: {}", lthread, owner.task, err);
    }
    owner.with_lthread(lthread)
}

/// Creates `task` with `creator` as chief and pager
///
/// Returns thread 0 of the new task, already unlocked.
///
/// # Panics
///
/// Panics if `task_new` fails.
pub fn spawn_task(kernel: &SimulatedKernel, creator: ThreadId, task: TaskNo) -> ThreadId {
    let request = TaskNewRequest::create(task, TaskSpec::new(0x1000, 0x2000, creator));
    match kernel.task_new(creator, request) {
        Ok(reply) => reply.id(),
        Err(err) => panic!("creating {} from {}: {}", task, creator, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_kernel() {
        let (kernel, boot) = boot_kernel();
        assert_eq!(kernel.current_thread(), Some(boot.key()));
    }

    #[test]
    fn test_spawn_thread_is_ready_and_paged() {
        let (kernel, boot) = boot_kernel();
        let worker = spawn_thread(&kernel, boot, LThreadNo(3));
        let thread = kernel.thread(worker).unwrap();
        assert!(thread.is_ready());
        assert_eq!(thread.pager(), Some(boot));
        assert_eq!(thread.lock_owner(), None);
    }

    #[test]
    fn test_spawn_task_releases_lock() {
        let (kernel, boot) = boot_kernel();
        let child = spawn_task(&kernel, boot, TaskNo(7));
        assert_eq!(child, ThreadId::main(TaskNo(7)).with_nest(1));
        assert_eq!(kernel.thread(child).unwrap().lock_owner(), None);
    }
}
