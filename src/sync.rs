cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    } else if #[cfg(feature = "std")] {
        pub(crate) use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    } else {
        pub(crate) use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(loom, feature = "shuttle"))] {
        /// Contention backoff which cooperates with the model checker by
        /// yielding instead of spinning.
        pub(crate) struct Backoff;

        impl Backoff {
            pub(crate) fn new() -> Self {
                Backoff
            }

            pub(crate) fn snooze(&self) {
                #[cfg(loom)]
                loom::thread::yield_now();
                #[cfg(all(feature = "shuttle", not(loom)))]
                shuttle::thread::yield_now();
            }
        }
    } else {
        pub(crate) use crossbeam_utils::Backoff;
    }
}
