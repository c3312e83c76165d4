//! The multi-word compare-and-swap engine.
//!
//! An operation is a sorted array of CAS rows plus a state word. Completion
//! walks the rows in address order and installs a [Helper] into each target
//! word; a thread that finds a foreign descriptor in its way helps that
//! operation to completion first and retries. Once every row is installed,
//! or one row definitively failed, the state is latched and a cleanup pass
//! replaces the installed helpers with the rows' final values.
//!
//! Address-ordered rows are mandatory: two operations with overlapping
//! address sets always collide in the same order, so helping cannot cycle.

use crate::descriptor::{self, DescriptorHeader, DescriptorKind};
use crate::domain::{Domain, ThreadContext};
use crate::hp::{HazardPointers, HpSlot};
use crate::pool::{self, DescriptorPool};
use crate::progress::Limit;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use crate::word;

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::fmt;
use core::ptr;

#[cfg(feature = "tracing")]
use tracing::instrument;

mod helper;

pub use helper::Helper;

/// Distinguished non-null row marker for a row that lost its install race.
/// Never dereferenced.
pub(crate) const FAIL_SENTINEL: *mut Helper = 0x1 as *mut Helper;

/// Nested helping beyond this depth unwinds back to the owning operation,
/// which then goes through the announcement table instead.
const MAX_HELP_DEPTH: usize = 16;

/// The state of an operation. `Deleted` is only ever stored by descriptor
/// destruction, as a tripwire for late accesses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum McasState {
    InProgress = 0,
    Pass = 1,
    Fail = 2,
    Deleted = 3,
}

impl TryFrom<usize> for McasState {
    type Error = usize;

    fn try_from(state: usize) -> Result<Self, usize> {
        match state {
            s if s == McasState::InProgress as usize => Ok(McasState::InProgress),
            s if s == McasState::Pass as usize => Ok(McasState::Pass),
            s if s == McasState::Fail as usize => Ok(McasState::Fail),
            s if s == McasState::Deleted as usize => Ok(McasState::Deleted),
            s => Err(s),
        }
    }
}

/// One word of work: replace `expected_value` with `new_value` at `address`
/// iff every other row holds its expected value as well.
pub(crate) struct CasRow {
    address: *const AtomicUsize,
    expected_value: usize,
    new_value: usize,
    /// null until the row is decided, then either a real [Helper] or
    /// [FAIL_SENTINEL], never overwritten again.
    pub(crate) helper: AtomicPtr<Helper>,
}

impl CasRow {
    fn empty() -> Self {
        Self {
            address: ptr::null(),
            expected_value: 0,
            new_value: 0,
            helper: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Shared body of an operation. Reached by other threads through marked
/// words and the announcement table, so it lives behind a raw pointer from
/// the moment `execute` starts until the pool reclaims it.
#[repr(C)]
pub(crate) struct McasInner {
    pub(crate) header: DescriptorHeader,
    pub(crate) rows: Box<[CasRow]>,
    row_count: usize,
    state: AtomicUsize,
}

impl McasInner {
    fn new(max_rows: usize) -> Self {
        let rows: Vec<CasRow> = (0..max_rows).map(|_| CasRow::empty()).collect();
        Self {
            header: DescriptorHeader::new(DescriptorKind::Mcas),
            rows: rows.into_boxed_slice(),
            row_count: 0,
            state: AtomicUsize::new(McasState::InProgress as usize),
        }
    }

    pub(crate) fn state(&self) -> McasState {
        match McasState::try_from(self.state.load(Ordering::SeqCst)) {
            Ok(state) => state,
            Err(_) => {
                debug_assert!(false, "operation state is corrupt");
                McasState::Fail
            }
        }
    }

    /// Latches a terminal state. A no-op if the operation is already
    /// terminal; terminal states never change again.
    fn latch(&self, desired: McasState) {
        let _ = self.state.compare_exchange(
            McasState::InProgress as usize,
            desired as usize,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn add_triple(&mut self, address: *const AtomicUsize, expected: usize, new: usize) -> bool {
        if !word::is_valid(expected) || !word::is_valid(new) {
            return false;
        }
        if self.row_count == self.rows.len() {
            return false;
        }
        if self.rows[..self.row_count]
            .iter()
            .any(|row| row.address == address)
        {
            return false;
        }

        self.rows[self.row_count] = CasRow {
            address,
            expected_value: expected,
            new_value: new,
            helper: AtomicPtr::new(ptr::null_mut()),
        };
        // Bubble the fresh row down to its address-ordered position.
        let mut position = self.row_count;
        while position > 0 && self.rows[position].address < self.rows[position - 1].address {
            self.rows.swap(position, position - 1);
            position -= 1;
        }
        self.row_count += 1;
        true
    }

    /// Drives the operation from row `start` until the state latches.
    /// Returns whether the operation passed. In wait-free mode (running on
    /// behalf of an announcement) the work budget and the recursive-return
    /// protocol are disabled and the loop simply runs to a terminal state.
    ///
    /// Safety: `self` must be pinned by the caller (initiator ownership, a
    /// watch, or an owner pin).
    pub(crate) unsafe fn complete(
        &self,
        ctx: &mut ThreadContext<'_>,
        start: usize,
        wf_mode: bool,
    ) -> bool {
        for position in start..self.row_count {
            let row = &self.rows[position];
            let mut limit = Limit::new();
            let mut current: Option<usize> = None;

            while row.helper.load(Ordering::SeqCst).is_null() {
                match self.state() {
                    McasState::InProgress => {}
                    state => return state == McasState::Pass,
                }

                if !wf_mode && limit.is_delayed() {
                    if ctx.recursion_depth() == 0 {
                        // Our own operation is starved: publish it and let
                        // the whole domain drive it home.
                        let op = (self as *const McasInner)
                            .cast_mut()
                            .cast::<DescriptorHeader>();
                        ctx.domain().progress().make_announcement(ctx, op);
                        debug_assert!(self.state() != McasState::InProgress);
                        return self.state() == McasState::Pass;
                    }
                    ctx.set_recursive_return();
                    return false;
                }

                let value = match current.take() {
                    Some(value) => value,
                    None => (*row.address).load(Ordering::SeqCst),
                };

                if word::is_descriptor(value) {
                    let next = self.resolve_conflict(ctx, position, value);
                    if ctx.recursive_return() {
                        if ctx.recursion_depth() == 0 {
                            // Back at our own frame; resume with a fresh read.
                            ctx.clear_recursive_return();
                        } else {
                            return false;
                        }
                    } else {
                        current = Some(next);
                    }
                } else if value != row.expected_value {
                    match row.helper.compare_exchange(
                        ptr::null_mut(),
                        FAIL_SENTINEL,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => {
                            self.latch(McasState::Fail);
                            return false;
                        }
                        Err(actual) if actual == FAIL_SENTINEL => {
                            self.latch(McasState::Fail);
                            return false;
                        }
                        Err(_) => {
                            // A concurrent helper made it in after all;
                            // re-evaluate the word.
                        }
                    }
                } else {
                    let helper = ctx.get_descriptor(Helper::new(self, position));
                    let marked = word::mark(helper.cast::<DescriptorHeader>());
                    match (*row.address).compare_exchange(
                        value,
                        marked,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => {
                            match row.helper.compare_exchange(
                                ptr::null_mut(),
                                helper,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(_) => break,
                                Err(actual) if actual == helper => break,
                                Err(_) => {
                                    // The row was decided without this
                                    // helper; take it back out of the word.
                                    let _ = (*row.address).compare_exchange(
                                        marked,
                                        row.expected_value,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    );
                                    Helper::pin_owner(helper);
                                    ctx.free_descriptor(
                                        helper.cast::<DescriptorHeader>(),
                                        false,
                                    );
                                    if row.helper.load(Ordering::SeqCst) == FAIL_SENTINEL {
                                        self.latch(McasState::Fail);
                                    }
                                    debug_assert!(self.state() != McasState::InProgress);
                                    return self.state() == McasState::Pass;
                                }
                            }
                        }
                        Err(actual) => {
                            // Lost the install race; the helper was never
                            // published.
                            ctx.free_descriptor(helper.cast::<DescriptorHeader>(), true);
                            current = Some(actual);
                        }
                    }
                }
            }

            if row.helper.load(Ordering::SeqCst) == FAIL_SENTINEL {
                self.latch(McasState::Fail);
                return false;
            }
        }

        self.latch(McasState::Pass);
        self.state() == McasState::Pass
    }

    /// Clears a foreign descriptor out of row `position`'s word by helping
    /// its operation, and returns the word's subsequent value.
    ///
    /// Watching the descriptor runs its `on_watch` reaction first; when the
    /// conflict was this operation's own helper, that reaction has just
    /// bound the row and no helping is needed (the returned value is unused,
    /// the caller's loop re-checks the row).
    unsafe fn resolve_conflict(
        &self,
        ctx: &mut ThreadContext<'_>,
        position: usize,
        observed: usize,
    ) -> usize {
        let row = &self.rows[position];
        let address = &*row.address;
        let descriptor = word::unmark(observed);

        if pool::watch(
            ctx.hazard_pointers(),
            ctx.index(),
            HpSlot::ShortUse,
            descriptor,
            address,
            observed,
        ) {
            pool::unwatch(descriptor);
            if !row.helper.load(Ordering::SeqCst).is_null() {
                return 0;
            }
            remove_descriptor(ctx, descriptor, address, observed);
        }
        address.load(Ordering::SeqCst)
    }

    /// Replaces every installed helper with the row's final value. Runs once
    /// on the initiating thread after the state latched; concurrent helpers
    /// may have done parts of this already, so every CAS is a single
    /// attempt.
    unsafe fn cleanup(&self, success: bool) {
        for position in 0..self.row_count {
            let row = &self.rows[position];
            let helper = row.helper.load(Ordering::SeqCst);
            debug_assert!(!helper.is_null());
            if helper == FAIL_SENTINEL {
                // Rows beyond this one were never attempted.
                return;
            }
            let marked = word::mark(helper.cast::<DescriptorHeader>());
            if (*row.address).load(Ordering::SeqCst) == marked {
                let resolved = if success {
                    row.new_value
                } else {
                    row.expected_value
                };
                let _ = (*row.address).compare_exchange(
                    marked,
                    resolved,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    /// Whether any bound row helper is still watched; part of the liveness
    /// scan for the operation itself.
    pub(crate) unsafe fn any_helper_watched(hp: &HazardPointers, mcas: *mut McasInner) -> bool {
        let inner = &*mcas;
        for position in 0..inner.row_count {
            let helper = inner.rows[position].helper.load(Ordering::SeqCst);
            if helper == FAIL_SENTINEL || helper.is_null() {
                break;
            }
            if hp.is_watched(helper.cast::<DescriptorHeader>()) {
                return true;
            }
        }
        false
    }

    /// Destroys a quiescent operation, recycling its bound helpers through
    /// the pool.
    pub(crate) unsafe fn destroy(pool: &mut DescriptorPool, mcas: *mut McasInner) {
        Self::destroy_with(mcas, |helper| pool.recycle_helper(helper));
    }

    /// Destruction with a caller-chosen disposal for the bound helpers (the
    /// domain teardown frees them outright).
    pub(crate) unsafe fn destroy_with(
        mcas: *mut McasInner,
        mut dispose: impl FnMut(*mut DescriptorHeader),
    ) {
        (*mcas)
            .state
            .store(McasState::Deleted as usize, Ordering::SeqCst);
        for position in 0..(*mcas).row_count {
            let helper = (*mcas).rows[position].helper.load(Ordering::SeqCst);
            if helper == FAIL_SENTINEL || helper.is_null() {
                break;
            }
            dispose(helper.cast::<DescriptorHeader>());
        }
        drop(Box::from_raw(mcas));
    }
}

/// Recursively drives the operation owning `descriptor` to completion so
/// that the word at `address` stops holding it. Bounded by the per-thread
/// help depth; past the bound it starts the cooperative unwind instead.
pub(crate) unsafe fn remove_descriptor(
    ctx: &mut ThreadContext<'_>,
    descriptor: *mut DescriptorHeader,
    address: &AtomicUsize,
    observed: usize,
) {
    if ctx.recursion_depth() >= MAX_HELP_DEPTH {
        ctx.set_recursive_return();
        return;
    }
    if pool::watch(
        ctx.hazard_pointers(),
        ctx.index(),
        HpSlot::ShortUse,
        descriptor,
        address,
        observed,
    ) {
        ctx.enter_recursion();
        descriptor::complete_and_clear(ctx, descriptor, address, observed);
        ctx.exit_recursion();
        pool::unwatch(descriptor);
    }
}

/// A multi-word compare-and-swap in the making.
///
/// Register up to `max_rows` CAS triples with [add_triple](Mcas::add_triple),
/// then [execute](Mcas::execute). The operation atomically replaces every
/// expected value with its new value, or leaves every word logically
/// untouched.
pub struct Mcas<'d> {
    inner: Option<Box<McasInner>>,
    domain: &'d Domain,
}

// The raw target pointers inside are only dereferenced under the helping
// protocol; moving the unexecuted operation between threads is harmless.
unsafe impl Send for Mcas<'_> {}

impl<'d> Mcas<'d> {
    pub(crate) fn new(domain: &'d Domain, max_rows: usize) -> Self {
        Self {
            inner: Some(Box::new(McasInner::new(max_rows))),
            domain,
        }
    }

    /// Registers one CAS triple. Returns false, without changing the
    /// operation, when either value uses a reserved bit, the operation is
    /// full, or the address is already registered.
    pub fn add_triple(&mut self, address: &'d AtomicUsize, expected: usize, new: usize) -> bool {
        match self.inner.as_mut() {
            Some(inner) => inner.add_triple(address, expected, new),
            None => false,
        }
    }

    /// Number of registered rows.
    pub fn row_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.row_count)
    }

    /// Applies the operation. Returns true if every word held its expected
    /// value and was replaced by its new value; false if any word did not.
    /// A false return is the normal outcome of contention, not an error:
    /// the logical value of every word is preserved.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn execute(mut self, ctx: &mut ThreadContext<'d>) -> bool {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return false,
        };
        debug_assert!(
            core::ptr::eq(self.domain, ctx.domain()),
            "operation and context belong to different domains"
        );

        // Lend a hand to any starved operation before starting our own.
        self.domain.progress().check_for_announcement(ctx);

        let inner = Box::into_raw(inner);
        unsafe {
            let success = (*inner).complete(ctx, 0, false);
            debug_assert!(!ctx.recursive_return());
            (*inner).cleanup(success);
            ctx.free_descriptor(inner.cast::<DescriptorHeader>(), false);
            success
        }
    }
}

impl Drop for Mcas<'_> {
    fn drop(&mut self) {
        // Never executed: nothing was published, the plain drop suffices.
        if let Some(inner) = self.inner.take() {
            inner
                .state
                .store(McasState::Deleted as usize, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Mcas<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mcas")
            .field("rows", &self.row_count())
            .field("executed", &self.inner.is_none())
            .finish()
    }
}

#[cfg(all(test, feature = "std", not(loom), not(feature = "shuttle")))]
mod tests {
    use super::*;
    use crate::Domain;
    use test_log::test;
    use tracing::debug;

    #[test]
    fn two_words_pass() {
        let first = AtomicUsize::new(4);
        let second = AtomicUsize::new(8);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(2);
        assert!(op.add_triple(&first, 4, 40));
        assert!(op.add_triple(&second, 8, 80));
        assert!(op.execute(&mut ctx));

        debug!("first after execute: {first:?}");
        debug!("second after execute: {second:?}");
        assert_eq!(ctx.read(&first), 40);
        assert_eq!(ctx.read(&second), 80);
    }

    #[test]
    fn expected_mismatch_fails_and_preserves_words() {
        let target = AtomicUsize::new(4);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(1);
        assert!(op.add_triple(&target, 8, 40));
        assert!(!op.execute(&mut ctx));
        assert_eq!(ctx.read(&target), 4);
    }

    #[test]
    fn mismatch_in_second_row_restores_the_first() {
        let first = AtomicUsize::new(4);
        let second = AtomicUsize::new(8);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(2);
        assert!(op.add_triple(&first, 4, 40));
        assert!(op.add_triple(&second, 12, 80));
        assert!(!op.execute(&mut ctx));

        assert_eq!(ctx.read(&first), 4);
        assert_eq!(ctx.read(&second), 8);
    }

    #[test]
    fn reserved_bits_are_rejected() {
        let target = AtomicUsize::new(0);
        let domain = Domain::new(1);
        let ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(2);
        assert!(!op.add_triple(&target, 0, 0x3));
        assert!(!op.add_triple(&target, 0x1, 4));
        assert_eq!(op.row_count(), 0);
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let first = AtomicUsize::new(4);
        let second = AtomicUsize::new(8);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(3);
        assert!(op.add_triple(&first, 4, 40));
        assert!(!op.add_triple(&first, 4, 44));
        assert_eq!(op.row_count(), 1);

        assert!(op.add_triple(&second, 8, 80));
        assert_eq!(op.row_count(), 2);
        assert!(op.execute(&mut ctx));
        assert_eq!(ctx.read(&first), 40);
        assert_eq!(ctx.read(&second), 80);
    }

    #[test]
    fn capacity_is_enforced() {
        let first = AtomicUsize::new(4);
        let second = AtomicUsize::new(8);
        let domain = Domain::new(1);
        let ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(1);
        assert!(op.add_triple(&first, 4, 40));
        assert!(!op.add_triple(&second, 8, 80));
        assert_eq!(op.row_count(), 1);
    }

    #[test]
    fn rows_are_kept_sorted_by_address() {
        let cells: [AtomicUsize; 4] = core::array::from_fn(|i| AtomicUsize::new(i * 4));
        let domain = Domain::new(1);
        let ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(4);
        // Register in reverse of the (arbitrary) address order.
        let mut refs: Vec<&AtomicUsize> = cells.iter().collect();
        refs.sort_by_key(|cell| *cell as *const AtomicUsize);
        refs.reverse();
        for (offset, cell) in refs.iter().enumerate() {
            assert!(op.add_triple(*cell, cell.load(Ordering::SeqCst), offset * 4));
        }

        let inner = op.inner.as_ref().unwrap();
        for position in 1..inner.row_count {
            assert!(inner.rows[position - 1].address < inner.rows[position].address);
        }
    }

    #[test]
    fn empty_operation_passes() {
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();
        let op = ctx.mcas(4);
        assert!(op.execute(&mut ctx));
    }

    #[test]
    fn reexecuting_identical_triples_fails_after_success() {
        let target = AtomicUsize::new(4);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let mut op = ctx.mcas(1);
        assert!(op.add_triple(&target, 4, 40));
        assert!(op.execute(&mut ctx));

        let mut again = ctx.mcas(1);
        assert!(again.add_triple(&target, 4, 40));
        assert!(!again.execute(&mut ctx));
        assert_eq!(ctx.read(&target), 40);
    }

    #[test]
    fn read_is_stable_without_writers() {
        let target = AtomicUsize::new(12);
        let domain = Domain::new(1);
        let mut ctx = domain.attach().unwrap();
        assert_eq!(ctx.read(&target), ctx.read(&target));
    }

    #[test]
    fn dropping_an_unexecuted_operation_is_clean() {
        let target = AtomicUsize::new(4);
        let domain = Domain::new(1);
        let ctx = domain.attach().unwrap();
        let mut op = ctx.mcas(1);
        assert!(op.add_triple(&target, 4, 40));
        drop(op);
        assert_eq!(target.load(Ordering::SeqCst), 4);
    }
}
