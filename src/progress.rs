//! Progress assurance.
//!
//! A domain-wide table with one announcement cell per thread. A thread whose
//! operation keeps losing its local races publishes the operation in its own
//! cell and drives it to completion in wait-free mode; every other thread
//! polls one cell (round-robin) before starting new work and helps whatever
//! it finds there. Together with the bounded [Limit] this turns the
//! best-effort helping scheme into a wait-free one.

use crate::descriptor::{self, DescriptorHeader};
use crate::domain::ThreadContext;
use crate::hp::HpSlot;
use crate::pool;
use crate::sync::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

pub(crate) struct ProgressAssurance {
    announcements: Box<[AtomicUsize]>,
}

impl ProgressAssurance {
    pub(crate) fn new(num_threads: usize) -> Self {
        let announcements: Vec<AtomicUsize> =
            (0..num_threads).map(|_| AtomicUsize::new(0)).collect();
        Self {
            announcements: announcements.into_boxed_slice(),
        }
    }

    /// Publishes `op` in the caller's cell and drives it to a terminal state
    /// in wait-free mode. Concurrent threads may pick the operation up and
    /// help; the cell is cleared once the owner's drive returns.
    ///
    /// Safety: `op` must stay allocated until it is freed through the pool's
    /// checked path, helpers may still hold pins when this returns.
    pub(crate) unsafe fn make_announcement(
        &self,
        ctx: &mut ThreadContext<'_>,
        op: *mut DescriptorHeader,
    ) {
        let cell = &self.announcements[ctx.index()];
        cell.store(op as usize, Ordering::SeqCst);
        descriptor::help_complete(ctx, op);
        cell.store(0, Ordering::SeqCst);
    }

    /// Helps at most one published operation. Each call inspects the next
    /// cell in round-robin order so a single delayed thread is found within
    /// `num_threads` calls.
    pub(crate) fn check_for_announcement(&self, ctx: &mut ThreadContext<'_>) {
        let cell = &self.announcements[ctx.next_help_index(self.announcements.len())];
        let value = cell.load(Ordering::SeqCst);
        if value == 0 {
            return;
        }
        let op = value as *mut DescriptorHeader;
        unsafe {
            if pool::watch(
                ctx.hazard_pointers(),
                ctx.index(),
                HpSlot::ProgAssur,
                op,
                cell,
                value,
            ) {
                descriptor::help_complete(ctx, op);
                pool::unwatch(op);
            }
        }
    }
}

/// Thread-local work budget. Every failed attempt is counted; once the
/// budget is exhausted the operation must switch to the announcement path.
/// The budget is sized so that a published operation completes within a
/// bounded number of every helper's own steps.
pub(crate) struct Limit {
    attempts: usize,
}

impl Limit {
    const MAX_ATTEMPTS: usize = 1024;

    pub(crate) fn new() -> Self {
        Self { attempts: 0 }
    }

    pub(crate) fn is_delayed(&mut self) -> bool {
        self.attempts += 1;
        self.attempts > Self::MAX_ATTEMPTS
    }
}

#[cfg(all(test, feature = "std", not(loom), not(feature = "shuttle")))]
mod tests {
    use super::*;

    #[test]
    fn limit_trips_only_after_the_budget() {
        let mut limit = Limit::new();
        for _ in 0..Limit::MAX_ATTEMPTS {
            assert!(!limit.is_delayed());
        }
        assert!(limit.is_delayed());
        assert!(limit.is_delayed());
    }

    #[test]
    fn empty_table_is_a_no_op() {
        let domain = crate::Domain::new(2);
        let mut ctx = domain.attach().unwrap();
        // Walk the cursor across every cell; nothing is published.
        domain.progress().check_for_announcement(&mut ctx);
        domain.progress().check_for_announcement(&mut ctx);
        domain.progress().check_for_announcement(&mut ctx);
    }
}
