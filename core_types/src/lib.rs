//! # Core Types
//!
//! This crate defines the identifiers shared by the kernel API and the
//! simulated kernel.
//!
//! ## Philosophy
//!
//! - **Numbers, not pointers**: Every kernel object is named by a small
//!   number that can be bounds-checked before it is used.
//! - **Sentinels are explicit**: `ThreadId::NIL` and `ThreadId::INVALID` are
//!   named constants with dedicated predicates.
//! - **Untrusted by default**: Only the task and thread numbers of an id take
//!   part in lookups.
//!
//! ## Key Types
//!
//! - [`TaskNo`]: Task slot number (index into the chief table)
//! - [`LThreadNo`]: Task-local thread number
//! - [`ThreadId`]: Full thread identifier including the clan nesting depth
//! - [`ThreadKey`]: The lookup part of a [`ThreadId`]

pub mod ids;

pub use ids::{LThreadNo, TaskNo, ThreadId, ThreadKey};
