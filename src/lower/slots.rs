//! Local-slot pool.
//!
//! Variables that qualify for register-like storage draw numbered slots
//! from this pool. Slots are typed by the target stack type and may be
//! reused by disjoint control-flow branches: the slot type list is shared
//! down an `if`, while the usage flags fork per arm. Slot numbers are
//! symbolic until the function's reserved locals are known; the lowerer
//! rebases them once.

use crate::wasm::StackType;

#[derive(Debug, Default)]
pub struct SlotPool {
    slots: Vec<StackType>,
}

/// Per-branch usage flags. Shorter than the slot list when a sibling branch
/// allocated more slots; missing entries count as free.
pub type SlotUse = Vec<bool>;

impl SlotPool {
    pub fn new() -> SlotPool {
        SlotPool::default()
    }

    /// Returns a free slot of the given type, allocating one if no existing
    /// slot can be reused.
    pub fn allocate(&mut self, ty: StackType, used: &mut SlotUse) -> u32 {
        for (i, t) in self.slots.iter().enumerate() {
            if *t == ty && !used.get(i).copied().unwrap_or(false) {
                if used.len() <= i {
                    used.resize(i + 1, false);
                }
                used[i] = true;
                return i as u32;
            }
        }
        self.slots.push(ty);
        used.resize(self.slots.len(), false);
        let idx = self.slots.len() - 1;
        used[idx] = true;
        idx as u32
    }

    /// The slot types, in allocation order. Appended to the function's
    /// locals after its reserved ones.
    pub fn slots(&self) -> &[StackType] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/t_slots.rs"]
mod t_slots;
