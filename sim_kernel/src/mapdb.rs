//! fpage_unmap and an in-memory mapping database
//!
//! The kernel only works out which rights to revoke. The mapping database
//! walks the derivation tree. [`SimMappingDb`] is a flat stand-in that keeps
//! one entry per (space, page) plus the space each mapping was derived from.

use crate::KernelState;
use core_types::{TaskNo, ThreadId};
use kernel_api::{Fpage, KernelError, MappingDatabase, UnmapFlags, UnmapRequest, UnmapRights, UnmapStatus};
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Page granularity of [`SimMappingDb`]
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Space this mapping was granted from; `None` for sigma0-style roots
    pub parent: Option<TaskNo>,
    pub rights: UnmapRights,
}

/// Flat mapping database keyed by (space, page base)
#[derive(Debug, Clone, Default)]
pub struct SimMappingDb {
    mappings: BTreeMap<(TaskNo, u64), Mapping>,
}

impl SimMappingDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a root mapping with `rights` for every page of `fpage`
    pub fn map_root(&mut self, space: TaskNo, fpage: Fpage, rights: UnmapRights) {
        for page in pages(fpage) {
            self.mappings.insert(
                (space, page),
                Mapping {
                    parent: None,
                    rights,
                },
            );
        }
    }

    /// Grants the pages of `fpage` from `from` to `to`
    ///
    /// Pages `from` does not hold are skipped. The derived mapping never
    /// carries more rights than its source.
    pub fn map(&mut self, from: TaskNo, to: TaskNo, fpage: Fpage, rights: UnmapRights) {
        for page in pages(fpage) {
            let Some(source) = self.mappings.get(&(from, page)).copied() else {
                continue;
            };
            let granted = rights & source.rights & (UnmapRights::READ | UnmapRights::WRITE);
            self.mappings.insert(
                (to, page),
                Mapping {
                    parent: Some(from),
                    rights: granted,
                },
            );
        }
    }

    pub fn lookup(&self, space: TaskNo, address: u64) -> Option<Mapping> {
        self.mappings
            .get(&(space, address - address % PAGE_SIZE))
            .copied()
    }

    /// Records a user access, setting the referenced and, for writes, dirty bits
    pub fn touch(&mut self, space: TaskNo, address: u64, write: bool) {
        if let Some(m) = self.mappings.get_mut(&(space, address - address % PAGE_SIZE)) {
            m.rights |= UnmapRights::REFERENCED;
            if write {
                m.rights |= UnmapRights::DIRTY;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Spaces holding mappings derived (transitively) from `space` at `page`
    fn descendants(&self, space: TaskNo, page: u64) -> Vec<TaskNo> {
        let mut found = Vec::new();
        let mut frontier = vec![space];
        while let Some(parent) = frontier.pop() {
            for (&(holder, p), m) in &self.mappings {
                if p == page && m.parent == Some(parent) && !found.contains(&holder) {
                    found.push(holder);
                    frontier.push(holder);
                }
            }
        }
        found
    }

    /// Page bases inside `fpage` that any space has mapped
    fn mapped_pages(&self, fpage: Fpage) -> BTreeSet<u64> {
        self.mappings
            .keys()
            .map(|&(_, page)| page)
            .filter(|&page| fpage.contains(page))
            .collect()
    }
}

fn pages(fpage: Fpage) -> impl Iterator<Item = u64> {
    let start = fpage.base - fpage.base % PAGE_SIZE;
    let end = fpage.end();
    (0..)
        .map(move |i: u64| start.saturating_add(i.saturating_mul(PAGE_SIZE)))
        .take_while(move |&page| page < end)
}

impl MappingDatabase for SimMappingDb {
    fn fpage_unmap(
        &mut self,
        space: TaskNo,
        fpage: Fpage,
        self_unmap: bool,
        restricted: Option<TaskNo>,
        what: UnmapRights,
    ) -> UnmapRights {
        let access = UnmapRights::READ | UnmapRights::WRITE;
        let bits = UnmapRights::REFERENCED | UnmapRights::DIRTY;
        let mut gathered = UnmapRights::empty();

        for page in self.mapped_pages(fpage) {
            let mut victims = self.descendants(space, page);
            if self_unmap {
                victims.push(space);
            }
            if let Some(only) = restricted {
                victims.retain(|&v| v == only);
            }

            for victim in victims {
                let Some(m) = self.mappings.get_mut(&(victim, page)) else {
                    continue;
                };
                gathered |= m.rights & bits;
                m.rights.remove(what);
                if !m.rights.intersects(access) {
                    self.mappings.remove(&(victim, page));
                }
            }
        }
        gathered
    }
}

/// Handle that lets a test keep inspecting the database it gave the kernel
#[derive(Debug, Clone, Default)]
pub struct SharedMappingDb(Arc<spin::Mutex<SimMappingDb>>);

impl SharedMappingDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimMappingDb) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl MappingDatabase for SharedMappingDb {
    fn fpage_unmap(
        &mut self,
        space: TaskNo,
        fpage: Fpage,
        self_unmap: bool,
        restricted: Option<TaskNo>,
        what: UnmapRights,
    ) -> UnmapRights {
        self.0
            .lock()
            .fpage_unmap(space, fpage, self_unmap, restricted, what)
    }
}

/// Rights revoked for `flags`
pub fn unmap_rights(flags: UnmapFlags) -> UnmapRights {
    let mut what = if flags.contains(UnmapFlags::NO_UNMAP) {
        UnmapRights::empty()
    } else if flags.contains(UnmapFlags::DOWNGRADE) {
        UnmapRights::WRITE
    } else {
        UnmapRights::WRITE | UnmapRights::READ
    };
    if flags.contains(UnmapFlags::RESET_REFERENCES) {
        what |= UnmapRights::REFERENCED | UnmapRights::DIRTY;
    }
    what
}

impl KernelState {
    pub(crate) fn fpage_unmap(
        &mut self,
        caller: ThreadId,
        request: UnmapRequest,
    ) -> Result<UnmapStatus, KernelError> {
        let space = self.live_thread(caller)?.id().task;
        let what = unmap_rights(request.flags);
        if what.is_empty() {
            return Ok(UnmapStatus::empty());
        }

        let self_unmap = request.flags.contains(UnmapFlags::SELF_UNMAP);
        let restricted = if self_unmap { None } else { request.restricted };
        trace!("unmap {:?} in {}: {:?}", request.fpage, space, what);
        let found = self
            .mapdb
            .fpage_unmap(space, request.fpage, self_unmap, restricted, what);

        let mut status = UnmapStatus::empty();
        if found.contains(UnmapRights::REFERENCED) {
            status |= UnmapStatus::REFERENCED;
        }
        if found.contains(UnmapRights::DIRTY) {
            status |= UnmapStatus::DIRTY;
        }
        Ok(status)
    }
}
