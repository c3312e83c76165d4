//! Reference-counted descriptor pool.
//!
//! Each attached thread owns a [DescriptorPool] layered over the domain-wide
//! `PoolManager`. Descriptors are allocated from the thread's safe list (or
//! freshly boxed) and returned through `DescriptorPool::free`. A checked free
//! parks the descriptor on the unsafe list; a periodic scan promotes entries
//! that are no longer watched. Pool memory is only handed back to the
//! allocator at domain teardown, which is what makes the speculative side of
//! the watch protocol sound: a stale watcher may touch recycled memory, but
//! never unmapped memory.
//!
//! The pool also hosts `ReadFirstOp`, the single-shot operation behind the
//! announced (wait-free) read path.

use crate::descriptor::{self, DescriptorHeader, DescriptorKind};
use crate::domain::ThreadContext;
use crate::hp::{HazardPointers, HpSlot};
use crate::mcas::McasInner;
use crate::sync::{AtomicPtr, AtomicUsize, Backoff, Ordering};
use crate::word;

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::ptr;

/// Number of unsafe-list entries that triggers a promotion scan.
const SCAN_THRESHOLD: usize = 16;

mod sealed {
    pub trait Sealed {}
}

/// Descriptor types that can be recycled through a [DescriptorPool].
pub(crate) trait PooledDescriptor: sealed::Sealed {
    const KIND: DescriptorKind;
}

impl sealed::Sealed for crate::mcas::Helper {}
impl PooledDescriptor for crate::mcas::Helper {
    const KIND: DescriptorKind = DescriptorKind::Helper;
}

impl sealed::Sealed for ReadFirstOp {}
impl PooledDescriptor for ReadFirstOp {
    const KIND: DescriptorKind = DescriptorKind::ReadFirst;
}

/// Establishes a persistent pin on `descriptor`.
///
/// The caller's hazard slot only bridges the race: the descriptor is
/// published in the slot, the word is confirmed to still hold `expected`,
/// the reference count is raised under that cover and the slot is released
/// again. The count survives arbitrarily deep nested helping, which a fixed
/// slot could not. The descriptor's `on_watch` reaction runs last and may
/// refuse the watch, rolling the pin back.
///
/// Safety: `expected` must be a value previously loaded from `address` that
/// designates `descriptor` (its marked form in a target word, its raw
/// address in an announcement cell).
pub(crate) unsafe fn watch(
    hp: &HazardPointers,
    thread_index: usize,
    slot: HpSlot,
    descriptor: *mut DescriptorHeader,
    address: &AtomicUsize,
    expected: usize,
) -> bool {
    if !hp.watch(thread_index, slot, descriptor as usize, address, expected) {
        return false;
    }
    (*descriptor).ref_count.fetch_add(1, Ordering::SeqCst);
    hp.unwatch(thread_index, slot);

    if descriptor::on_watch(descriptor) {
        true
    } else {
        (*descriptor).ref_count.fetch_sub(1, Ordering::SeqCst);
        false
    }
}

/// Releases a pin taken by [watch].
pub(crate) unsafe fn unwatch(descriptor: *mut DescriptorHeader) {
    let previous = (*descriptor).ref_count.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(previous > 0, "unwatch without a matching watch");
}

/// Thread-local descriptor pool.
pub struct DescriptorPool {
    safe_list: Vec<*mut DescriptorHeader>,
    unsafe_list: Vec<*mut DescriptorHeader>,
}

impl DescriptorPool {
    pub(crate) fn new() -> Self {
        Self {
            safe_list: Vec::new(),
            unsafe_list: Vec::new(),
        }
    }

    /// Returns a descriptor of type `K`, recycling a quiescent allocation of
    /// the same kind when one is available.
    pub(crate) fn get<K: PooledDescriptor>(&mut self, init: K) -> *mut K {
        if let Some(position) = self
            .safe_list
            .iter()
            .rposition(|&node| unsafe { (*node).kind } == K::KIND)
        {
            let node = self.safe_list.swap_remove(position).cast::<K>();
            // Pooled descriptors hold no owned allocations, so overwriting
            // the previous value in place is sufficient.
            unsafe { ptr::write(node, init) };
            node
        } else {
            Box::into_raw(Box::new(init))
        }
    }

    /// Returns `descriptor` to the pool.
    ///
    /// With `no_check` the caller certifies that no reference to the
    /// descriptor was ever published (or that every published reference has
    /// already been verified gone), and it becomes immediately reusable.
    /// Otherwise it is parked on the unsafe list until a scan observes it
    /// unwatched.
    ///
    /// Safety: `descriptor` must have been produced by this crate's pool or
    /// engine and the caller must hold no pin on it.
    pub(crate) unsafe fn free(
        &mut self,
        hp: &HazardPointers,
        descriptor: *mut DescriptorHeader,
        no_check: bool,
    ) {
        if no_check {
            self.release(descriptor);
        } else {
            self.unsafe_list.push(descriptor);
            if self.unsafe_list.len() >= SCAN_THRESHOLD {
                self.scan(hp);
            }
        }
    }

    /// Promotes unsafe-list entries that are no longer watched.
    pub(crate) fn scan(&mut self, hp: &HazardPointers) {
        let mut index = 0;
        while index < self.unsafe_list.len() {
            let node = self.unsafe_list[index];
            if unsafe { hp.is_watched(node) } {
                index += 1;
            } else {
                let node = self.unsafe_list.swap_remove(index);
                unsafe { self.release(node) };
            }
        }
    }

    /// Hands a quiescent descriptor over for reuse or destruction.
    unsafe fn release(&mut self, node: *mut DescriptorHeader) {
        match (*node).kind {
            DescriptorKind::Helper => {
                // A helper that was published without ever binding its row
                // still pins its operation; it is quiescent now, so let go.
                crate::mcas::Helper::release_owner_pin(node.cast());
                self.safe_list.push(node);
            }
            DescriptorKind::ReadFirst => self.safe_list.push(node),
            // Multi-word descriptors vary in row count and are not reused;
            // destruction recycles their bound helpers instead.
            DescriptorKind::Mcas => McasInner::destroy(self, node.cast::<McasInner>()),
        }
    }

    pub(crate) fn recycle_helper(&mut self, helper: *mut DescriptorHeader) {
        debug_assert_eq!(unsafe { (*helper).kind }, DescriptorKind::Helper);
        self.safe_list.push(helper);
    }

    /// Donates both lists to the manager at thread detach. One more scan runs
    /// first so that only genuinely contended descriptors stay unsafe.
    pub(crate) fn donate(&mut self, hp: &HazardPointers, manager: &PoolManager, index: usize) {
        self.scan(hp);
        manager.receive(index, &mut self.safe_list, &mut self.unsafe_list);
    }

    pub(crate) fn adopt(&mut self, manager: &PoolManager, index: usize) {
        manager.reclaim_safe(index, &mut self.safe_list);
    }
}

impl core::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("safe", &self.safe_list.len())
            .field("pending", &self.unsafe_list.len())
            .finish()
    }
}

struct DonationSlot {
    safe: AtomicPtr<DescriptorHeader>,
    pending: AtomicPtr<DescriptorHeader>,
}

/// Domain-wide owner of descriptor memory donated by detached threads.
pub(crate) struct PoolManager {
    slots: Box<[DonationSlot]>,
}

impl PoolManager {
    pub(crate) fn new(num_threads: usize) -> Self {
        let slots: Vec<DonationSlot> = (0..num_threads)
            .map(|_| DonationSlot {
                safe: AtomicPtr::new(ptr::null_mut()),
                pending: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Accepts a detaching thread's lists. The slot is owned by exactly one
    /// live thread at a time, so a plain chain-and-store handoff suffices.
    fn receive(
        &self,
        index: usize,
        safe: &mut Vec<*mut DescriptorHeader>,
        pending: &mut Vec<*mut DescriptorHeader>,
    ) {
        Self::prepend(&self.slots[index].safe, safe);
        Self::prepend(&self.slots[index].pending, pending);
    }

    fn prepend(head: &AtomicPtr<DescriptorHeader>, nodes: &mut Vec<*mut DescriptorHeader>) {
        let mut chain = head.load(Ordering::Acquire);
        for &node in nodes.iter() {
            unsafe { (*node).next.store(chain, Ordering::Relaxed) };
            chain = node;
        }
        head.store(chain, Ordering::Release);
        nodes.clear();
    }

    /// Moves a slot's previously donated safe chain into an attaching
    /// thread's pool.
    fn reclaim_safe(&self, index: usize, safe: &mut Vec<*mut DescriptorHeader>) {
        let mut node = self.slots[index].safe.swap(ptr::null_mut(), Ordering::AcqRel);
        while !node.is_null() {
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            safe.push(node);
            node = next;
        }
    }

    /// Frees every donated descriptor. Called from the domain destructor,
    /// which asserts nothing is watched any more.
    pub(crate) fn reclaim_all(&self, hp: &HazardPointers) {
        // First drop the owner pins of never-bound helpers so the watched
        // assertion below does not trip over pins nobody will release.
        let mut chains = Vec::new();
        for slot in self.slots.iter() {
            for head in [&slot.safe, &slot.pending] {
                let chain = head.swap(ptr::null_mut(), Ordering::AcqRel);
                let mut node = chain;
                while !node.is_null() {
                    unsafe {
                        if (*node).kind == DescriptorKind::Helper {
                            crate::mcas::Helper::release_owner_pin(node.cast());
                        }
                        node = (*node).next.load(Ordering::Relaxed);
                    }
                }
                chains.push(chain);
            }
        }
        for chain in chains {
            let mut node = chain;
            while !node.is_null() {
                let next = unsafe { (*node).next.load(Ordering::Relaxed) };
                debug_assert!(
                    !unsafe { hp.is_watched(node) },
                    "descriptor still watched at teardown"
                );
                unsafe { destroy(node) };
                node = next;
            }
        }
    }
}

/// Frees a descriptor allocation outright. For a multi-word descriptor the
/// bound row helpers are owned by its rows and are freed with it.
pub(crate) unsafe fn destroy(node: *mut DescriptorHeader) {
    match (*node).kind {
        DescriptorKind::Helper => drop(Box::from_raw(node.cast::<crate::mcas::Helper>())),
        DescriptorKind::ReadFirst => drop(Box::from_raw(node.cast::<ReadFirstOp>())),
        DescriptorKind::Mcas => McasInner::destroy_with(node.cast::<McasInner>(), |helper| {
            drop(unsafe { Box::from_raw(helper.cast::<crate::mcas::Helper>()) })
        }),
    }
}

/// Single-shot announced read of one word.
///
/// Published to the announcement table when the direct read loop exhausts its
/// work budget; any thread can then drive it to a quiescent value.
#[repr(C)]
pub(crate) struct ReadFirstOp {
    pub(crate) header: DescriptorHeader,
    address: *const AtomicUsize,
    /// Resolved logical value; zero until the operation completes. A logical
    /// zero result is still written (and re-written) correctly, every path
    /// publishes before returning.
    value: AtomicUsize,
}

impl ReadFirstOp {
    pub(crate) fn new(address: *const AtomicUsize) -> Self {
        Self {
            header: DescriptorHeader::new(DescriptorKind::ReadFirst),
            address,
            value: AtomicUsize::new(0),
        }
    }

    pub(crate) fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Resolves the first layer of indirection at the target word and
    /// publishes the result. Descriptors nested deeper than one level are
    /// handled inside `logical_value`.
    ///
    /// Safety: `op` must be pinned by the caller and its target cell must
    /// outlive the domain.
    pub(crate) unsafe fn help_complete(ctx: &mut ThreadContext<'_>, op: *mut ReadFirstOp) {
        let backoff = Backoff::new();
        let address = &*(*op).address;
        while (*op).value.load(Ordering::SeqCst) == 0 {
            let current = address.load(Ordering::SeqCst);
            if !word::is_descriptor(current) {
                let _ = (*op)
                    .value
                    .compare_exchange(0, current, Ordering::SeqCst, Ordering::SeqCst);
                return;
            }
            let descriptor = word::unmark(current);
            if watch(
                ctx.hazard_pointers(),
                ctx.index(),
                HpSlot::ShortUse,
                descriptor,
                address,
                current,
            ) {
                let logical = descriptor::logical_value(descriptor);
                unwatch(descriptor);
                let _ = (*op)
                    .value
                    .compare_exchange(0, logical, Ordering::SeqCst, Ordering::SeqCst);
                return;
            }
            backoff.snooze();
        }
    }
}

#[cfg(all(test, feature = "std", not(loom), not(feature = "shuttle")))]
mod tests {
    use super::*;

    #[test]
    fn get_reuses_freed_descriptors_of_the_same_kind() {
        let hp = HazardPointers::new(1);
        let mut pool = DescriptorPool::new();

        let cell = AtomicUsize::new(0);
        let first = pool.get(ReadFirstOp::new(&cell));
        unsafe { pool.free(&hp, first.cast::<DescriptorHeader>(), true) };

        let second = pool.get(ReadFirstOp::new(&cell));
        assert_eq!(first, second, "quiescent allocation was not recycled");
        unsafe { destroy(second.cast::<DescriptorHeader>()) };
    }

    #[test]
    fn checked_free_defers_watched_descriptors() {
        let hp = HazardPointers::new(1);
        let mut pool = DescriptorPool::new();

        let cell = AtomicUsize::new(0);
        let op = pool.get(ReadFirstOp::new(&cell));
        let header = op.cast::<DescriptorHeader>();

        unsafe { (*header).ref_count.fetch_add(1, Ordering::SeqCst) };
        unsafe { pool.free(&hp, header, false) };
        pool.scan(&hp);
        assert!(pool.safe_list.is_empty(), "watched descriptor was promoted");

        unsafe { unwatch(header) };
        pool.scan(&hp);
        assert_eq!(pool.safe_list.len(), 1);

        unsafe { destroy(pool.safe_list.pop().unwrap()) };
    }

    #[test]
    fn donated_safe_list_is_adopted_on_attach() {
        let hp = HazardPointers::new(1);
        let manager = PoolManager::new(1);
        let mut pool = DescriptorPool::new();

        let cell = AtomicUsize::new(0);
        let op = pool.get(ReadFirstOp::new(&cell));
        unsafe { pool.free(&hp, op.cast::<DescriptorHeader>(), true) };
        pool.donate(&hp, &manager, 0);
        assert!(pool.safe_list.is_empty());

        let mut successor = DescriptorPool::new();
        successor.adopt(&manager, 0);
        assert_eq!(successor.safe_list.len(), 1);

        successor.donate(&hp, &manager, 0);
        manager.reclaim_all(&hp);
    }

    #[test]
    fn watch_pins_and_unwatch_releases() {
        let hp = HazardPointers::new(1);
        let mut pool = DescriptorPool::new();

        let cell = AtomicUsize::new(0);
        let op = pool.get(ReadFirstOp::new(&cell));
        let header = op.cast::<DescriptorHeader>();
        let word = AtomicUsize::new(word::mark(header));

        let marked = word.load(Ordering::SeqCst);
        assert!(unsafe { watch(&hp, 0, HpSlot::ShortUse, header, &word, marked) });
        assert!(unsafe { hp.is_watched(header) });
        assert!(
            !hp.contains(header as usize),
            "slot should be released once the count is taken"
        );

        unsafe { unwatch(header) };
        assert!(!unsafe { hp.is_watched(header) });

        unsafe { destroy(header) };
    }

    #[test]
    fn watch_fails_when_the_word_moved_on() {
        let hp = HazardPointers::new(1);
        let mut pool = DescriptorPool::new();

        let cell = AtomicUsize::new(0);
        let op = pool.get(ReadFirstOp::new(&cell));
        let header = op.cast::<DescriptorHeader>();
        let marked = word::mark(header);
        let word = AtomicUsize::new(0x100);

        assert!(!unsafe { watch(&hp, 0, HpSlot::ShortUse, header, &word, marked) });
        assert!(!unsafe { hp.is_watched(header) });

        unsafe { destroy(header) };
    }

    #[test]
    fn announced_read_resolves_a_plain_word() {
        let target = AtomicUsize::new(96);
        let domain = crate::Domain::new(1);
        let mut ctx = domain.attach().unwrap();

        let op = ctx.get_descriptor(ReadFirstOp::new(&target));
        unsafe {
            ReadFirstOp::help_complete(&mut ctx, op);
            assert_eq!((*op).value(), 96);
            ctx.free_descriptor(op.cast::<DescriptorHeader>(), false);
        }
    }
}
