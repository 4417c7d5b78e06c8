//! # Kernel API
//!
//! This crate defines the scheduling and task-control syscall surface of
//! the kernel.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Timeslices and priorities (not fairness)
//! - Chiefs that mediate cross-clan traffic (not a naming service)
//! - Pagers and capability handlers as the only outside controllers
//! - Memory budgets handed down a tree (not a global allocator)
//!
//! ## Design Goals
//!
//! 1. **Testability**: The entire API runs against the simulated kernel
//! 2. **Explicitness**: Every syscall names its caller
//! 3. **Type safety**: Verbs, flags and replies are typed, not packed words
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A register-level ABI (packing is platform specific)
//! - A virtual memory model (`fpage_unmap` delegates to [`MappingDatabase`])

pub mod error;
pub mod kernel;
pub mod syscalls;
pub mod time;

pub use error::KernelError;
pub use kernel::{KernelApi, MappingDatabase, ThreadLock};
pub use syscalls::{
    ClanRelation, ExRegsFlags, ExRegsReply, ExRegsRequest, ExternalState, Fpage, Nearest, Prio,
    QuotaDescriptor, ScheduleReply, ScheduleVerb, SliceId, TaskNewKind, TaskNewReply,
    TaskNewRequest, TaskSpec, ThreadScheduleReply, ThreadSwitchReply, TimesharingParam,
    UnmapFlags, UnmapRequest, UnmapRights, UnmapStatus, UserIp,
};
pub use time::{Duration, Instant};
