//! Per-row companion descriptor.

use crate::descriptor::{DescriptorHeader, DescriptorKind};
use crate::domain::ThreadContext;
use crate::mcas::{McasInner, McasState};
use crate::sync::{AtomicUsize, Ordering};

use core::ptr;

/// Installed into a target word while the row it belongs to is in flight.
/// The word's logical value is derived from the helper for as long as it is
/// installed. Carries its operation by pointer and its row by index; the
/// operation owns the row array.
#[repr(C)]
pub struct Helper {
    pub(crate) header: DescriptorHeader,
    mcas: *const McasInner,
    row_index: usize,
    /// True while this helper, freed without ever being bound to its row,
    /// still pins its operation against reclamation. Cleared by the pool
    /// scan that recycles the helper. Only touched by the owning thread.
    pub(crate) owner_pinned: bool,
}

impl Helper {
    pub(crate) fn new(mcas: *const McasInner, row_index: usize) -> Self {
        Self {
            header: DescriptorHeader::new(DescriptorKind::Helper),
            mcas,
            row_index,
            owner_pinned: false,
        }
    }

    /// The logical value of the word this helper occupies: the row's new
    /// value once the operation passed with this helper bound, the expected
    /// value otherwise.
    ///
    /// Safety: `helper` must be pinned; safe to call with no further
    /// synchronization.
    pub(crate) unsafe fn logical_value(helper: *mut Helper) -> usize {
        let mcas = &*(*helper).mcas;
        let row = &mcas.rows[(*helper).row_index];
        if mcas.state() == McasState::Pass && row.helper.load(Ordering::SeqCst) == helper {
            row.new_value
        } else {
            row.expected_value
        }
    }

    /// Watch reaction: try to bind this helper to its row. Returns true if
    /// the row's helper is now this one, no matter which thread installed
    /// it. A false return refuses the watch, the row was decided some other
    /// way and the watcher need not help through this helper.
    pub(crate) unsafe fn on_watch(helper: *mut Helper) -> bool {
        let mcas = &*(*helper).mcas;
        let row = &mcas.rows[(*helper).row_index];
        let _ = row
            .helper
            .compare_exchange(ptr::null_mut(), helper, Ordering::SeqCst, Ordering::SeqCst);
        row.helper.load(Ordering::SeqCst) == helper
    }

    /// Drives the helper's operation to a terminal state, then makes sure
    /// the word at `address` no longer holds this helper.
    ///
    /// Safety: `helper` must be pinned and `observed` (its marked form) must
    /// have been validated against `address` under that pin.
    pub(crate) unsafe fn complete_and_clear(
        ctx: &mut ThreadContext<'_>,
        helper: *mut Helper,
        address: *const AtomicUsize,
        observed: usize,
    ) {
        let mcas = (*helper).mcas;
        let row = &(*mcas).rows[(*helper).row_index];
        let _ = row
            .helper
            .compare_exchange(ptr::null_mut(), helper, Ordering::SeqCst, Ordering::SeqCst);

        if row.helper.load(Ordering::SeqCst) == helper {
            let success = (*mcas).complete(ctx, (*helper).row_index, false);
            if ctx.recursive_return() {
                // Unwinding; leave the word to whichever frame resumes.
                return;
            }
            let resolved = if success {
                row.new_value
            } else {
                row.expected_value
            };
            let _ =
                (*address).compare_exchange(observed, resolved, Ordering::SeqCst, Ordering::SeqCst);
        } else {
            // The helper lost its row. The word must not keep pointing at a
            // helper that never took effect.
            let _ = (*address).compare_exchange(
                observed,
                row.expected_value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Pins the owning operation on behalf of a published-but-unbound
    /// helper. Released by the pool when the helper is recycled.
    pub(crate) unsafe fn pin_owner(helper: *mut Helper) {
        let mcas = (*helper).mcas;
        (*mcas).header.ref_count.fetch_add(1, Ordering::SeqCst);
        (*helper).owner_pinned = true;
    }

    pub(crate) unsafe fn release_owner_pin(helper: *mut Helper) {
        if (*helper).owner_pinned {
            (*helper).owner_pinned = false;
            let mcas = (*helper).mcas;
            let previous = (*mcas).header.ref_count.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(previous > 0);
        }
    }
}
