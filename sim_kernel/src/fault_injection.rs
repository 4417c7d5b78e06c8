//! Deterministic race injection for testing
//!
//! Concurrent creators and chief transfers are hard to hit on purpose. A
//! [`RacePlan`] lets a test fire the interfering write at exactly the point
//! where a real racer would have slipped in.
//!
//! ## Design Philosophy
//!
//! - **Deterministic**: A fault fires at its hook and nowhere else
//! - **Single shot**: Each planned fault is consumed the first time it fires
//! - **Test-focused**: Not intended for production use
//!
//! ## Example
//!
//! ```
//! use sim_kernel::fault_injection::{RaceFault, RacePlan};
//! use core_types::TaskNo;
//!
//! let plan = RacePlan::new()
//!     .with_fault(RaceFault::InstallCompetitor { task: TaskNo(5) })
//!     .with_fault(RaceFault::StealChief { task: TaskNo(6), new_chief: TaskNo(7) });
//! assert_eq!(plan.faults().len(), 2);
//! ```

use core_types::TaskNo;
use serde::{Deserialize, Serialize};

/// An interfering write to perform inside `task_new`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceFault {
    /// Another creator fills `task` between the slot check and the install
    InstallCompetitor { task: TaskNo },

    /// Another writer hands `task` to `new_chief` right before a transfer's
    /// compare-and-set
    StealChief { task: TaskNo, new_chief: TaskNo },

    /// Another creator empties `task` and fills it again after the install
    /// but before thread 0 is built
    SupersedeBeforeBuild { task: TaskNo },
}

/// A plan describing all races to inject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RacePlan {
    faults: Vec<RaceFault>,
}

impl RacePlan {
    pub fn new() -> Self {
        Self { faults: Vec::new() }
    }

    pub fn with_fault(mut self, fault: RaceFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn faults(&self) -> &[RaceFault] {
        &self.faults
    }
}

/// Applies a [`RacePlan`], keeping track of what already fired
#[derive(Debug, Clone, Default)]
pub struct RaceInjector {
    pending: Vec<RaceFault>,
    fired: Vec<RaceFault>,
}

impl RaceInjector {
    pub fn new(plan: RacePlan) -> Self {
        Self {
            pending: plan.faults,
            fired: Vec::new(),
        }
    }

    fn take(&mut self, matches: impl Fn(&RaceFault) -> bool) -> Option<RaceFault> {
        let index = self.pending.iter().position(matches)?;
        let fault = self.pending.remove(index);
        self.fired.push(fault);
        Some(fault)
    }

    /// True if a competitor should be installed in `task` now
    pub fn take_competitor(&mut self, task: TaskNo) -> bool {
        self.take(|f| matches!(f, RaceFault::InstallCompetitor { task: t } if *t == task))
            .is_some()
    }

    /// Chief a racing writer installs for `task`, if one is planned
    pub fn take_steal_chief(&mut self, task: TaskNo) -> Option<TaskNo> {
        match self.take(|f| matches!(f, RaceFault::StealChief { task: t, .. } if *t == task))? {
            RaceFault::StealChief { new_chief, .. } => Some(new_chief),
            _ => None,
        }
    }

    /// True if `task` should be recreated under the creator's feet now
    pub fn take_supersede(&mut self, task: TaskNo) -> bool {
        self.take(|f| matches!(f, RaceFault::SupersedeBeforeBuild { task: t } if *t == task))
            .is_some()
    }

    pub fn pending(&self) -> &[RaceFault] {
        &self.pending
    }

    pub fn fired(&self) -> &[RaceFault] {
        &self.fired
    }
}
