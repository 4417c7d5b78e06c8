//! Chief table
//!
//! Every task slot, occupied or not, has a chief: the task allowed to create
//! and delete tasks in that slot. The chief relation forms a tree rooted at
//! the boot task, which is its own chief.

use core_types::TaskNo;
use kernel_api::ClanRelation;

#[derive(Debug, Clone)]
pub struct SpaceIndex {
    chiefs: Vec<TaskNo>,
    root: TaskNo,
}

impl SpaceIndex {
    /// Creates a table of `max_tasks` slots, all owned by `root`
    pub fn new(max_tasks: u16, root: TaskNo) -> Self {
        Self {
            chiefs: vec![root; usize::from(max_tasks)],
            root,
        }
    }

    pub fn root(&self) -> TaskNo {
        self.root
    }

    pub fn len(&self) -> usize {
        self.chiefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chiefs.is_empty()
    }

    pub fn in_range(&self, task: TaskNo) -> bool {
        task.index() < self.chiefs.len()
    }

    pub fn chief(&self, task: TaskNo) -> Option<TaskNo> {
        self.chiefs.get(task.index()).copied()
    }

    /// Sets the chief of `task` only if it is still `expected`
    pub fn compare_and_set_chief(&mut self, task: TaskNo, expected: TaskNo, new: TaskNo) -> bool {
        match self.chiefs.get_mut(task.index()) {
            Some(chief) if *chief == expected => {
                *chief = new;
                true
            }
            _ => false,
        }
    }

    /// Number of chief hops from `task` up to the root
    pub fn depth(&self, task: TaskNo) -> u8 {
        let mut depth: u8 = 0;
        let mut cursor = task;
        for _ in 0..self.chiefs.len() {
            if cursor == self.root {
                break;
            }
            match self.chief(cursor) {
                Some(chief) if chief != cursor => {
                    depth = depth.saturating_add(1);
                    cursor = chief;
                }
                _ => break,
            }
        }
        depth
    }

    /// True if `candidate` is `root` or lies below it in the chief tree
    pub fn is_in_subtree(&self, candidate: TaskNo, root: TaskNo) -> bool {
        let mut cursor = candidate;
        for _ in 0..=self.chiefs.len() {
            if cursor == root {
                return true;
            }
            if cursor == self.root {
                return false;
            }
            match self.chief(cursor) {
                Some(chief) if chief != cursor => cursor = chief,
                _ => return false,
            }
        }
        false
    }

    /// Slots whose chief is `task`
    pub fn subtasks(&self, task: TaskNo) -> Vec<TaskNo> {
        self.chiefs
            .iter()
            .enumerate()
            .filter_map(|(slot, &chief)| {
                let slot = TaskNo(u16::try_from(slot).ok()?);
                (chief == task && slot != task).then_some(slot)
            })
            .collect()
    }

    /// Next hop from `me` towards `dst`
    ///
    /// Tasks in the same clan talk directly. A destination inside one of my
    /// subclans is reached through the subtask of mine that roots it; any
    /// other destination is reached through my chief.
    pub fn nearest(&self, me: TaskNo, dst: TaskNo) -> (TaskNo, ClanRelation) {
        let my_chief = self.chief(me).unwrap_or(self.root);
        let dst_chief = self.chief(dst).unwrap_or(self.root);

        if dst == my_chief || dst_chief == my_chief || dst_chief == me {
            return (dst, ClanRelation::SameClan);
        }

        let mut cursor = dst;
        for _ in 0..self.chiefs.len() {
            if cursor == self.root {
                break;
            }
            match self.chief(cursor) {
                Some(chief) if chief == me => return (cursor, ClanRelation::InnerClan),
                Some(chief) if chief != cursor => cursor = chief,
                _ => break,
            }
        }

        (my_chief, ClanRelation::OuterClan)
    }
}
