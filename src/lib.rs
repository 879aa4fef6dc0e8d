//! Petek: pluggable safe memory reclamation for lock-free data structures.
//!
//! A lock-free structure unlinks a node with a CAS and then faces the hard
//! part: some other thread may still be dereferencing it. Petek packages
//! the three classic answers behind one [`Reclaim`] capability so the
//! structure picks its strategy at the type level and monomorphizes — no
//! virtual dispatch on the hot path:
//!
//! - [`Hazard`] — hazard pointers: per-thread published slots, batched
//!   scan-and-free. Bounded unreclaimed memory, a SeqCst publish per
//!   protected pointer.
//! - [`Epoch`] — epoch-based reclamation: a global epoch, per-thread
//!   announcements, three rotating retirement buckets. Near-zero read
//!   cost; a stalled reader stalls reclamation.
//! - [`Leak`] / [`ImmediateDrop`] — controls: the throughput ceiling and
//!   the ABA demonstrator.
//!
//! The crate also carries the supporting cast those strategies and their
//! consumers need: a size-classed [`pool`] that keeps node churn off the
//! OS allocator, and a jittered [`Backoff`] for CAS retry loops.
//!
//! # Example
//!
//! ```rust
//! use petek::{Hazard, Reclaim};
//!
//! let guard = Hazard::enter();
//! // load a pointer, protect it, re-validate, dereference...
//! Hazard::protect(&guard, 0, core::ptr::null_mut());
//! drop(guard);
//! ```
//!
//! The companion crate `petek-queue` is the canonical consumer: an
//! unbounded MPMC queue generic over the strategy.

#![warn(missing_docs)]

mod backoff;
mod epoch;
mod hazard;
mod leak;
pub mod pool;
mod reclaim;
mod ttas;

pub use backoff::Backoff;
pub use epoch::{Epoch, EpochGuard};
pub use hazard::{Hazard, HazardGuard};
pub use leak::{ImmediateDrop, Leak};
pub use reclaim::{DropFn, Reclaim, Retired};

/// Introspection for tests and drivers: per-thread retirees awaiting
/// reclamation, by strategy.
pub mod stats {
    /// Retirees buffered by the current thread under [`Hazard`](crate::Hazard).
    pub fn hazard_pending() -> usize {
        crate::hazard::pending()
    }

    /// Retirees bucketed by the current thread under [`Epoch`](crate::Epoch).
    pub fn epoch_pending() -> usize {
        crate::epoch::pending()
    }
}
