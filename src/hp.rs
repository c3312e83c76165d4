//! Hazard-pointer slot table.
//!
//! A fixed table of `num_threads * SLOTS_PER_THREAD` atomic cells. Each cell
//! is written only by its owning thread and read by every thread during
//! reclamation scans. The table is allocated once per [Domain](crate::Domain)
//! and never relocated.

use crate::descriptor::{self, DescriptorHeader};
use crate::sync::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Per-thread hazard slots. `ShortUse` covers the read/helping fast path,
/// `ProgAssur` pins an operation taken from the announcement table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HpSlot {
    /// Transient pin while inspecting a descriptor found in a word.
    ShortUse = 0,
    /// Pin on a published operation while helping it.
    ProgAssur = 1,
}

pub(crate) const SLOTS_PER_THREAD: usize = 2;

/// The process-wide watch table.
pub struct HazardPointers {
    watches: Box<[AtomicUsize]>,
}

impl HazardPointers {
    pub(crate) fn new(num_threads: usize) -> Self {
        let watches: Vec<AtomicUsize> = (0..num_threads * SLOTS_PER_THREAD)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Self {
            watches: watches.into_boxed_slice(),
        }
    }

    fn cell(&self, thread_index: usize, slot: HpSlot) -> &AtomicUsize {
        &self.watches[thread_index * SLOTS_PER_THREAD + slot as usize]
    }

    /// Publishes `value` in the caller's slot, then confirms the word at
    /// `address` still holds `expected`. On mismatch the slot is cleared and
    /// the watch fails. The store and the confirming load are sequentially
    /// consistent; the load must not be reordered before the store.
    pub fn watch(
        &self,
        thread_index: usize,
        slot: HpSlot,
        value: usize,
        address: &AtomicUsize,
        expected: usize,
    ) -> bool {
        let cell = self.cell(thread_index, slot);
        cell.store(value, Ordering::SeqCst);
        if address.load(Ordering::SeqCst) == expected {
            true
        } else {
            cell.store(0, Ordering::SeqCst);
            false
        }
    }

    /// Clears the caller's slot.
    pub fn unwatch(&self, thread_index: usize, slot: HpSlot) {
        self.cell(thread_index, slot).store(0, Ordering::SeqCst);
    }

    /// Scans every slot of every thread for `value`.
    pub fn contains(&self, value: usize) -> bool {
        self.watches
            .iter()
            .any(|cell| cell.load(Ordering::SeqCst) == value)
    }

    /// Full liveness check for a descriptor: pinned by count, present in a
    /// slot, or reported live by its kind-specific scan.
    ///
    /// Safety: `descriptor` must point to a descriptor that has not been
    /// reclaimed (pool memory stays mapped for the domain's lifetime).
    pub(crate) unsafe fn is_watched(&self, descriptor: *mut DescriptorHeader) -> bool {
        if (*descriptor).ref_count.load(Ordering::SeqCst) > 0 {
            return true;
        }
        if self.contains(descriptor as usize) {
            return true;
        }
        descriptor::on_is_watched(self, descriptor)
    }
}

impl core::fmt::Debug for HazardPointers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HazardPointers")
            .field("slots", &self.watches.len())
            .finish()
    }
}

impl Drop for HazardPointers {
    fn drop(&mut self) {
        for cell in self.watches.iter() {
            debug_assert_eq!(
                cell.load(Ordering::SeqCst),
                0,
                "a descriptor was still watched at teardown"
            );
        }
    }
}
