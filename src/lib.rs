//! # MCAS
//!
//! A wait-free multi-word compare-and-swap library. An operation atomically
//! updates N independent words from N expected values to N new values,
//! succeeding only if every expected value is observed. It only requires
//! single-width compare-and-swap from the platform; wait-freedom comes from
//! helping: any thread that runs into an in-flight operation adopts it and
//! drives it to completion, and operations that keep losing their local
//! races are published to an announcement table where every thread helps
//! them across the line.
//!
//! # Usage
//! ## Example
//! ```edition2021
//! use mcas::Domain;
//! use std::sync::atomic::AtomicUsize;
//!
//! // Target cells hold plain machine words; the two lowest bits are
//! // reserved by the library. Declare them before the domain so they
//! // outlive it.
//! let first = AtomicUsize::new(4);
//! let second = AtomicUsize::new(8);
//!
//! // One domain per set of cooperating threads.
//! let domain = Domain::new(2);
//!
//! std::thread::scope(|scope| {
//!     let (domain, first, second) = (&domain, &first, &second);
//!     for offset in [100usize, 200] {
//!         scope.spawn(move || {
//!             let mut ctx = domain.attach().unwrap();
//!             let mut op = ctx.mcas(2);
//!             assert!(op.add_triple(first, 4, 4 + offset));
//!             assert!(op.add_triple(second, 8, 8 + offset));
//!             // Exactly one of the two competing operations succeeds.
//!             op.execute(&mut ctx);
//!         });
//!     }
//! });
//!
//! let mut ctx = domain.attach().unwrap();
//! let (a, b) = (ctx.read(&first), ctx.read(&second));
//! assert!((a, b) == (104, 108) || (a, b) == (204, 208));
//! ```
//!
//! ## Details
//! Begin by creating a [Domain], which holds everything the threads share:
//! the hazard-pointer table used to pin in-flight descriptors, the
//! descriptor pool that recycles them, and the announcement table behind the
//! wait-free guarantee. A domain is sized for a fixed number of threads and
//! reserves all shared memory up front.
//!
//! Each participating thread calls [Domain::attach] to claim a
//! [ThreadContext]. The context carries the thread's hazard slots and its
//! descriptor pool; dropping it detaches the thread and returns its slot.
//!
//! A multi-word operation is built with [ThreadContext::mcas], filled with
//! [Mcas::add_triple] and applied with [Mcas::execute]. `add_triple` rejects
//! values that collide with the reserved bit layout, duplicate addresses and
//! overflow beyond the operation's capacity by returning `false`; these are
//! expected outcomes rather than errors. `execute` returns
//! whether the operation passed; a failed operation leaves the logical value
//! of every word untouched.
//!
//! Words that may be targeted by an operation must always be read through
//! [ThreadContext::read], which resolves the logical value of a word even
//! while an operation's descriptor sits in it.
//!
//! # Limitations
//! ## Values must keep the reserved bits clear
//! Target words hold arbitrary `usize` values except that the two lowest
//! bits must be zero ([RESERVED_BITS](word::RESERVED_BITS)). Shifted
//! integers and pointers to 4-byte-aligned data satisfy this naturally.
//!
//! ## Target cells must outlive the domain
//! Helping means another thread may touch a target word on your behalf;
//! the library therefore ties target references to the domain borrow.
//! Declare target cells before the domain (or otherwise guarantee they
//! outlive it) and the borrow checker does the rest.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_debug_implementations, missing_docs)]

extern crate alloc;

mod descriptor;
mod domain;
mod err;
mod mcas;
mod progress;
mod sync;

pub mod hp;
pub mod pool;
pub mod word;

pub use domain::{Domain, ThreadContext};
pub use err::AttachError;
pub use mcas::Mcas;
