//! Descriptor kinds and their dispatch table.
//!
//! A word can only carry a thin pointer, so descriptors cannot be trait
//! objects. Every descriptor type instead begins with a [DescriptorHeader]
//! (`#[repr(C)]`, header first) carrying its kind, and the free functions in
//! this module dispatch on that kind. Three kinds exist: the per-row
//! [Helper](crate::mcas::Helper) installed into target words, the single-shot
//! [ReadFirstOp](crate::pool::ReadFirstOp) used by announced reads, and the
//! [multi-word operation](crate::mcas::McasInner) itself, which is never
//! installed into a word but is published to the announcement table.

use crate::hp::HazardPointers;
use crate::mcas::{Helper, McasInner};
use crate::pool::ReadFirstOp;
use crate::domain::ThreadContext;
use crate::sync::{AtomicPtr, AtomicUsize};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum DescriptorKind {
    Helper,
    ReadFirst,
    Mcas,
}

/// Common prefix of every descriptor type.
#[repr(C)]
pub struct DescriptorHeader {
    pub(crate) kind: DescriptorKind,
    /// Pin count maintained by the watch protocol. A descriptor with a
    /// positive count must not be reclaimed or recycled.
    pub(crate) ref_count: AtomicUsize,
    /// Intrusive link used while the descriptor sits in a donated pool list.
    pub(crate) next: AtomicPtr<DescriptorHeader>,
}

impl DescriptorHeader {
    pub(crate) fn new(kind: DescriptorKind) -> Self {
        Self {
            kind,
            ref_count: AtomicUsize::new(0),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// The logical value a word holds while `descriptor` is installed in it.
///
/// Safety: `descriptor` must be pinned by the caller (slot or count).
pub(crate) unsafe fn logical_value(descriptor: *mut DescriptorHeader) -> usize {
    match (*descriptor).kind {
        DescriptorKind::Helper => Helper::logical_value(descriptor.cast::<Helper>()),
        // Only helpers are ever installed into words.
        DescriptorKind::ReadFirst | DescriptorKind::Mcas => {
            debug_assert!(false, "non-installable descriptor found in a word");
            0
        }
    }
}

/// Kind-specific reaction to a newly established watch. Returning false
/// refuses the watch and the caller's pin is rolled back.
pub(crate) unsafe fn on_watch(descriptor: *mut DescriptorHeader) -> bool {
    match (*descriptor).kind {
        DescriptorKind::Helper => Helper::on_watch(descriptor.cast::<Helper>()),
        DescriptorKind::ReadFirst | DescriptorKind::Mcas => true,
    }
}

/// Kind-specific extension of the liveness scan: a multi-word operation is
/// still watched while any of its bound row helpers is.
pub(crate) unsafe fn on_is_watched(hp: &HazardPointers, descriptor: *mut DescriptorHeader) -> bool {
    match (*descriptor).kind {
        DescriptorKind::Mcas => McasInner::any_helper_watched(hp, descriptor.cast::<McasInner>()),
        DescriptorKind::Helper | DescriptorKind::ReadFirst => false,
    }
}

/// Drives a published operation to a terminal state on behalf of another
/// thread. Invoked through the announcement table.
///
/// Safety: `descriptor` must be pinned by the caller.
pub(crate) unsafe fn help_complete(ctx: &mut ThreadContext<'_>, descriptor: *mut DescriptorHeader) {
    match (*descriptor).kind {
        DescriptorKind::Mcas => {
            let mcas = descriptor.cast::<McasInner>();
            (*mcas).complete(ctx, 0, true);
        }
        DescriptorKind::ReadFirst => ReadFirstOp::help_complete(ctx, descriptor.cast::<ReadFirstOp>()),
        DescriptorKind::Helper => debug_assert!(false, "helpers are not announceable"),
    }
}

/// Ensures the word at `address` stops holding `observed` (a marked pointer
/// to `descriptor`) by completing the descriptor's owning operation.
///
/// Safety: `descriptor` must be pinned by the caller and `observed` must have
/// been validated against `address` under that pin.
pub(crate) unsafe fn complete_and_clear(
    ctx: &mut ThreadContext<'_>,
    descriptor: *mut DescriptorHeader,
    address: *const AtomicUsize,
    observed: usize,
) {
    match (*descriptor).kind {
        DescriptorKind::Helper => {
            Helper::complete_and_clear(ctx, descriptor.cast::<Helper>(), address, observed)
        }
        DescriptorKind::ReadFirst | DescriptorKind::Mcas => {
            debug_assert!(false, "non-installable descriptor found in a word")
        }
    }
}
