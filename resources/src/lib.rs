//! # Resources
//!
//! This crate provides hierarchical RAM quotas for kernel object allocation.
//!
//! ## Philosophy
//!
//! - **Budgets are enforced, not advisory**
//! - **Every byte is charged to exactly one node**
//! - **Accounting is deterministic and testable**
//!
//! ## Core Concepts
//!
//! - [`RamQuota`]: one budget node (`max`, `current`, holder count)
//! - [`QuotaTree`]: arena of nodes addressed by [`QuotaId`], rooted at the
//!   boot quota
//! - A *carve-out* child reserves its whole `max` from the parent up front,
//!   so a child can never push the parent beyond its remaining budget.
//! - A *share* is another holder of an existing node; it allocates nothing.
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A memory allocator (nodes count bytes, they do not hand out memory)
//! - Per-page accounting

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Stable handle of a quota node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuotaId(pub u32);

impl QuotaId {
    /// The root (boot) quota
    pub const ROOT: QuotaId = QuotaId(0);
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quota({})", self.0)
    }
}

/// Quota accounting errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("Unknown quota: {0}")]
    UnknownQuota(QuotaId),

    #[error("Quota exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: u64, available: u64 },

    #[error("{0} still has {1} bytes charged")]
    InUse(QuotaId, u64),

    #[error("The root quota cannot be released")]
    Root,
}

/// A single budget node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamQuota {
    parent: Option<QuotaId>,
    max: u64,
    current: u64,
    holders: u32,
}

impl RamQuota {
    pub fn parent(&self) -> Option<QuotaId> {
        self.parent
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Bytes currently charged to this node (including carve-outs)
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn available(&self) -> u64 {
        self.max - self.current
    }

    /// Number of tasks holding this node
    pub fn holders(&self) -> u32 {
        self.holders
    }

    fn charge(&mut self, bytes: u64) -> Result<(), QuotaError> {
        match self.current.checked_add(bytes) {
            Some(total) if total <= self.max => {
                self.current = total;
                Ok(())
            }
            _ => Err(QuotaError::Exhausted {
                requested: bytes,
                available: self.available(),
            }),
        }
    }
}

/// Arena of quota nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaTree {
    nodes: BTreeMap<QuotaId, RamQuota>,
    next_id: u32,
}

impl QuotaTree {
    /// Creates a tree whose root holds `root_max` bytes
    pub fn new(root_max: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            QuotaId::ROOT,
            RamQuota {
                parent: None,
                max: root_max,
                current: 0,
                holders: 1,
            },
        );
        Self { nodes, next_id: 1 }
    }

    pub fn get(&self, id: QuotaId) -> Option<&RamQuota> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: QuotaId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node_mut(&mut self, id: QuotaId) -> Result<&mut RamQuota, QuotaError> {
        self.nodes.get_mut(&id).ok_or(QuotaError::UnknownQuota(id))
    }

    /// Charges `bytes` against `id`
    pub fn alloc(&mut self, id: QuotaId, bytes: u64) -> Result<(), QuotaError> {
        self.node_mut(id)?.charge(bytes)
    }

    /// Returns `bytes` previously charged against `id`
    pub fn free(&mut self, id: QuotaId, bytes: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            debug_assert!(node.current >= bytes, "quota underflow on {}", id);
            node.current = node.current.saturating_sub(bytes);
        }
    }

    /// Carves a bounded child out of `parent`
    ///
    /// The parent is charged the full `max` immediately and gains a holder
    /// for as long as the child exists. The new node starts with one holder.
    pub fn alloc_child(&mut self, parent: QuotaId, max: u64) -> Result<QuotaId, QuotaError> {
        let node = self.node_mut(parent)?;
        node.charge(max)?;
        node.holders += 1;

        let id = QuotaId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            RamQuota {
                parent: Some(parent),
                max,
                current: 0,
                holders: 1,
            },
        );
        Ok(id)
    }

    /// Adds a holder to an existing node
    pub fn share(&mut self, id: QuotaId) -> Result<QuotaId, QuotaError> {
        let node = self.node_mut(id)?;
        node.holders += 1;
        Ok(id)
    }

    /// Drops one holder of `id`
    ///
    /// When the last holder of a carved child goes away the node is removed,
    /// its reservation is returned to the parent and the parent loses the
    /// holder the child contributed. Nodes that still carry charges cannot
    /// lose their last holder.
    pub fn release(&mut self, id: QuotaId) -> Result<(), QuotaError> {
        let mut cursor = id;
        loop {
            let node = self.node_mut(cursor)?;
            if node.holders > 1 {
                node.holders -= 1;
                return Ok(());
            }
            if cursor == QuotaId::ROOT {
                return Err(QuotaError::Root);
            }
            if node.current != 0 {
                return Err(QuotaError::InUse(cursor, node.current));
            }

            let parent = node.parent;
            let max = node.max;
            self.nodes.remove(&cursor);
            match parent {
                Some(parent) => {
                    self.free(parent, max);
                    cursor = parent;
                }
                None => return Ok(()),
            }
        }
    }

    /// Walks from `id` to the root
    pub fn ancestors(&self, id: QuotaId) -> Vec<QuotaId> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        chain
    }
}
