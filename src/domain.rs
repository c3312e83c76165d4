//! Process-wide domain and per-thread contexts.
//!
//! A [Domain] owns everything the threads share: the hazard-pointer table,
//! the descriptor pool manager and the announcement table, all sized for a
//! fixed number of threads at construction. Threads participate through a
//! [ThreadContext], which claims one of the domain's thread slots for as
//! long as it lives and returns it (donating its descriptor pool) on drop.
//! There is no global state; everything hangs off the domain.

use crate::descriptor::{self, DescriptorHeader};
use crate::err::AttachError;
use crate::hp::{HazardPointers, HpSlot};
use crate::mcas::Mcas;
use crate::pool::{self, DescriptorPool, PoolManager, PooledDescriptor, ReadFirstOp};
use crate::progress::{Limit, ProgressAssurance};
use crate::sync::{AtomicBool, AtomicUsize, Backoff, Ordering};
use crate::word;

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::fmt;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Shared home of every structure the wait-free operations need. Target
/// cells handed to [ThreadContext::read] and [Mcas::add_triple] must stay
/// allocated for as long as the domain has attached threads; the borrow on
/// the domain enforces this for the usual stack ordering.
pub struct Domain {
    hazard: HazardPointers,
    pools: PoolManager,
    progress: ProgressAssurance,
    attached: Box<[AtomicBool]>,
    attached_count: AtomicUsize,
}

impl Domain {
    /// Builds a domain for at most `num_threads` concurrently attached
    /// threads. All shared memory is reserved up front and never relocated.
    pub fn new(num_threads: usize) -> Self {
        let attached: Vec<AtomicBool> = (0..num_threads).map(|_| AtomicBool::new(false)).collect();
        Self {
            hazard: HazardPointers::new(num_threads),
            pools: PoolManager::new(num_threads),
            progress: ProgressAssurance::new(num_threads),
            attached: attached.into_boxed_slice(),
            attached_count: AtomicUsize::new(0),
        }
    }

    /// Claims a free thread slot. Fails once `num_threads` contexts are
    /// live; a dropped context frees its slot for reuse.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn attach(&self) -> Result<ThreadContext<'_>, AttachError> {
        for index in 0..self.attached.len() {
            if self.attached[index]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.attached_count.fetch_add(1, Ordering::AcqRel);
                let mut pool = DescriptorPool::new();
                pool.adopt(&self.pools, index);
                return Ok(ThreadContext {
                    domain: self,
                    index,
                    pool,
                    recursion_depth: 0,
                    recursive_return: false,
                    help_cursor: index,
                });
            }
        }
        Err(AttachError)
    }

    /// The maximum number of concurrently attached threads.
    pub fn num_threads(&self) -> usize {
        self.attached.len()
    }

    pub(crate) fn progress(&self) -> &ProgressAssurance {
        &self.progress
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // Every context borrows the domain, so all pools have been donated
        // by now; free them while the hazard table is still around to check.
        self.pools.reclaim_all(&self.hazard);
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("num_threads", &self.attached.len())
            .field(
                "attached",
                &self.attached_count.load(Ordering::Acquire),
            )
            .finish()
    }
}

/// A thread's handle into a [Domain]: its hazard slots, its descriptor pool
/// and its helping bookkeeping. One per attached thread; dropping it
/// detaches the thread.
pub struct ThreadContext<'d> {
    domain: &'d Domain,
    index: usize,
    pool: DescriptorPool,
    recursion_depth: usize,
    recursive_return: bool,
    help_cursor: usize,
}

// The pool's raw pointers are owned by this context alone; handing the whole
// context to another thread keeps that ownership intact.
unsafe impl Send for ThreadContext<'_> {}

impl<'d> ThreadContext<'d> {
    /// The thread slot this context occupies.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Starts a multi-word compare-and-swap of up to `max_rows` words.
    pub fn mcas(&self, max_rows: usize) -> Mcas<'d> {
        Mcas::new(self.domain, max_rows)
    }

    /// Linearizable tag-aware read of one word.
    ///
    /// Returns the word's logical value: a raw value is returned as-is,
    /// while a word occupied by an in-flight operation is resolved through
    /// the operation's descriptor. When the word stays contended past the
    /// work budget the read publishes itself to the announcement table and
    /// completes wait-free.
    #[cfg_attr(feature = "tracing", instrument(skip_all))]
    pub fn read(&mut self, address: &'d AtomicUsize) -> usize {
        let hazard = self.hazard_pointers();
        let backoff = Backoff::new();
        let mut limit = Limit::new();
        loop {
            let value = address.load(Ordering::SeqCst);
            if !word::is_descriptor(value) {
                return value;
            }
            if limit.is_delayed() {
                let op = self.pool.get(ReadFirstOp::new(address));
                unsafe {
                    let domain = self.domain;
                    domain
                        .progress()
                        .make_announcement(self, op.cast::<DescriptorHeader>());
                    let resolved = (*op).value();
                    self.free_descriptor(op.cast::<DescriptorHeader>(), false);
                    return resolved;
                }
            }
            let descriptor = word::unmark(value);
            unsafe {
                if pool::watch(
                    hazard,
                    self.index,
                    HpSlot::ShortUse,
                    descriptor,
                    address,
                    value,
                ) {
                    let logical = descriptor::logical_value(descriptor);
                    pool::unwatch(descriptor);
                    return logical;
                }
            }
            backoff.snooze();
        }
    }

    pub(crate) fn domain(&self) -> &'d Domain {
        self.domain
    }

    pub(crate) fn hazard_pointers(&self) -> &'d HazardPointers {
        &self.domain.hazard
    }

    pub(crate) fn get_descriptor<K: PooledDescriptor>(&mut self, init: K) -> *mut K {
        self.pool.get(init)
    }

    pub(crate) unsafe fn free_descriptor(
        &mut self,
        descriptor: *mut DescriptorHeader,
        no_check: bool,
    ) {
        let hazard = self.hazard_pointers();
        self.pool.free(hazard, descriptor, no_check);
    }

    pub(crate) fn recursion_depth(&self) -> usize {
        self.recursion_depth
    }

    pub(crate) fn enter_recursion(&mut self) {
        self.recursion_depth += 1;
    }

    pub(crate) fn exit_recursion(&mut self) {
        debug_assert!(self.recursion_depth > 0);
        self.recursion_depth -= 1;
    }

    pub(crate) fn recursive_return(&self) -> bool {
        self.recursive_return
    }

    pub(crate) fn set_recursive_return(&mut self) {
        self.recursive_return = true;
    }

    pub(crate) fn clear_recursive_return(&mut self) {
        self.recursive_return = false;
    }

    /// Round-robin cursor over the announcement table.
    pub(crate) fn next_help_index(&mut self, len: usize) -> usize {
        let index = self.help_cursor % len;
        self.help_cursor = self.help_cursor.wrapping_add(1);
        index
    }
}

impl Drop for ThreadContext<'_> {
    fn drop(&mut self) {
        self.pool
            .donate(&self.domain.hazard, &self.domain.pools, self.index);
        self.domain.attached[self.index].store(false, Ordering::Release);
        self.domain.attached_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ThreadContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("index", &self.index)
            .field("recursion_depth", &self.recursion_depth)
            .finish()
    }
}
