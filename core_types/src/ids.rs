//! Identifiers for kernel objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task number
///
/// Tasks are addressed by their slot in the kernel's chief table. Slot 0 is
/// reserved for the kernel itself and is what a nil thread id points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskNo(pub u16);

impl TaskNo {
    /// The reserved kernel slot
    pub const KERNEL: TaskNo = TaskNo(0);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the slot as a table index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:#x})", self.0)
    }
}

/// Task-local thread number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LThreadNo(pub u8);

impl LThreadNo {
    /// Thread 0 of a task anchors the task's identity
    pub const MAIN: LThreadNo = LThreadNo(0);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lookup key of a thread: task number plus local thread number
///
/// Kernel tables are keyed by this, never by a full [`ThreadId`], so a
/// forged nesting depth cannot select a different object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub task: TaskNo,
    pub lthread: LThreadNo,
}

impl ThreadKey {
    pub const fn new(task: TaskNo, lthread: LThreadNo) -> Self {
        Self { task, lthread }
    }

    /// Thread 0 of the given task
    pub const fn main(task: TaskNo) -> Self {
        Self::new(task, LThreadNo::MAIN)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:02x}", self.task.0, self.lthread.0)
    }
}

/// Full thread identifier
///
/// Besides the lookup key it carries the clan nesting depth of the owning
/// task (0 for the boot task, chief depth + 1 for every subtask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId {
    pub task: TaskNo,
    pub lthread: LThreadNo,
    pub nest: u8,
}

impl ThreadId {
    /// The nil id: "no thread" / "myself" depending on the syscall
    pub const NIL: ThreadId = ThreadId {
        task: TaskNo::KERNEL,
        lthread: LThreadNo(0),
        nest: 0,
    };

    /// The invalid id: all fields set
    pub const INVALID: ThreadId = ThreadId {
        task: TaskNo(u16::MAX),
        lthread: LThreadNo(u8::MAX),
        nest: u8::MAX,
    };

    pub const fn new(task: TaskNo, lthread: LThreadNo) -> Self {
        Self {
            task,
            lthread,
            nest: 0,
        }
    }

    /// Thread 0 of `task`
    pub const fn main(task: TaskNo) -> Self {
        Self::new(task, LThreadNo::MAIN)
    }

    pub const fn with_nest(mut self, nest: u8) -> Self {
        self.nest = nest;
        self
    }

    /// Same task, different local thread number
    pub const fn with_lthread(mut self, lthread: LThreadNo) -> Self {
        self.lthread = lthread;
        self
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    /// True for both sentinels
    pub fn is_sentinel(&self) -> bool {
        self.is_nil() || self.is_invalid()
    }

    pub const fn key(&self) -> ThreadKey {
        ThreadKey::new(self.task, self.lthread)
    }
}

impl From<ThreadId> for ThreadKey {
    fn from(id: ThreadId) -> Self {
        id.key()
    }
}

impl From<ThreadKey> for ThreadId {
    /// Id with nesting depth 0; callers that know the depth add it
    fn from(key: ThreadKey) -> Self {
        ThreadId::new(key.task, key.lthread)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Thread(nil)")
        } else if self.is_invalid() {
            write!(f, "Thread(invalid)")
        } else {
            write!(f, "Thread({})", self.key())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_distinct() {
        assert!(ThreadId::NIL.is_nil());
        assert!(!ThreadId::NIL.is_invalid());
        assert!(ThreadId::INVALID.is_invalid());
        assert!(!ThreadId::INVALID.is_nil());
        assert!(!ThreadId::main(TaskNo(4)).is_sentinel());
    }

    #[test]
    fn test_key_ignores_nest() {
        let a = ThreadId::new(TaskNo(5), LThreadNo(3)).with_nest(1);
        let b = ThreadId::new(TaskNo(5), LThreadNo(3)).with_nest(7);
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_with_lthread_keeps_task() {
        let id = ThreadId::main(TaskNo(9)).with_lthread(LThreadNo(2));
        assert_eq!(id.task, TaskNo(9));
        assert_eq!(id.lthread, LThreadNo(2));
    }

    #[test]
    fn test_thread_id_display() {
        let id = ThreadId::new(TaskNo(0x12), LThreadNo(1));
        assert_eq!(format!("{}", id), "Thread(12.01)");
        assert_eq!(format!("{}", ThreadId::NIL), "Thread(nil)");
    }

    #[test]
    fn test_thread_id_serde() {
        let id = ThreadId::new(TaskNo(7), LThreadNo(2)).with_nest(3);
        let json = serde_json::to_string(&id).unwrap();
        let back: ThreadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
