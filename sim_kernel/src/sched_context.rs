//! Timeslices
//!
//! Every thread owns a ring of scheduling contexts. Position 0 is the home
//! (timesharing) slice with id 0; it exists for the whole life of the thread.
//! Real-time slices follow it in creation order, so "insert in front of the
//! home slice" in ring order is a push at the end of the vector. The active
//! index always points into the ring.

use kernel_api::{Duration, KernelError, Prio, SliceId};
use serde::{Deserialize, Serialize};

/// Rounds a quantum up to the scheduler granularity
///
/// Zero stays zero. Quanta that would overflow when rounded saturate at the
/// largest representable multiple.
pub fn round_quantum(quantum: Duration, granularity: Duration) -> Duration {
    let q = quantum.as_micros();
    let g = granularity.as_micros();
    if q == 0 || g <= 1 {
        return quantum;
    }

    let rounded = match q.checked_add(g - 1) {
        Some(sum) => sum / g * g,
        None => u64::MAX / g * g,
    };
    Duration::from_micros(rounded)
}

/// One timeslice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedContext {
    id: SliceId,
    prio: Prio,
    quantum: Duration,
    left: Duration,
}

impl SchedContext {
    pub fn new(id: SliceId, prio: Prio, quantum: Duration) -> Self {
        Self {
            id,
            prio,
            quantum,
            left: quantum,
        }
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn prio(&self) -> Prio {
        self.prio
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Time left when the slice was last saved
    pub fn left(&self) -> Duration {
        self.left
    }

    pub fn is_home(&self) -> bool {
        self.id == 0
    }

    pub fn set_prio(&mut self, prio: Prio) {
        self.prio = prio;
    }

    pub fn set_quantum(&mut self, quantum: Duration) {
        self.quantum = quantum;
    }

    pub fn set_left(&mut self, left: Duration) {
        self.left = left;
    }

    /// Refills the slice to a full quantum
    pub fn replenish(&mut self) {
        self.left = self.quantum;
    }
}

/// Ring of timeslices owned by one thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedRing {
    slices: Vec<SchedContext>,
    active: usize,
}

impl SchedRing {
    /// Creates a ring holding only the home slice
    pub fn new(prio: Prio, quantum: Duration) -> Self {
        Self {
            slices: vec![SchedContext::new(0, prio, quantum)],
            active: 0,
        }
    }

    pub fn home(&self) -> &SchedContext {
        &self.slices[0]
    }

    pub fn home_mut(&mut self) -> &mut SchedContext {
        &mut self.slices[0]
    }

    pub fn active(&self) -> &SchedContext {
        &self.slices[self.active]
    }

    pub fn active_mut(&mut self) -> &mut SchedContext {
        &mut self.slices[self.active]
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn is_at_home(&self) -> bool {
        self.active == 0
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Ring never drops below the home slice
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn realtime_count(&self) -> usize {
        self.slices.len() - 1
    }

    /// Ring successor of `index`
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.slices.len()
    }

    /// Position of the first real-time slice (home if there is none)
    pub fn first_realtime_index(&self) -> usize {
        self.next_index(0)
    }

    pub fn position(&self, id: SliceId) -> Option<usize> {
        self.slices.iter().position(|s| s.id == id)
    }

    pub fn get(&self, id: SliceId) -> Option<&SchedContext> {
        self.slices.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SliceId) -> Option<&mut SchedContext> {
        self.slices.iter_mut().find(|s| s.id == id)
    }

    pub fn slice_at(&self, index: usize) -> Option<&SchedContext> {
        self.slices.get(index)
    }

    /// Makes the slice at `index` active
    ///
    /// Out-of-range indices wrap, so the active index stays inside the ring.
    pub fn set_active(&mut self, index: usize) {
        self.active = index % self.slices.len();
    }

    /// Appends a real-time slice behind the last one
    ///
    /// The new slice gets the id of its ring predecessor plus one.
    pub fn add_realtime(&mut self, prio: Prio, quantum: Duration) -> Result<SliceId, KernelError> {
        let last = self.slices[self.slices.len() - 1].id;
        let id = last.checked_add(1).ok_or(KernelError::TooManySlices)?;
        self.slices.push(SchedContext::new(id, prio, quantum));
        Ok(id)
    }

    /// Deletes every real-time slice and returns how many were removed
    pub fn remove_realtime(&mut self) -> usize {
        let removed = self.realtime_count();
        self.slices.truncate(1);
        self.active = 0;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchedContext> {
        self.slices.iter()
    }
}
