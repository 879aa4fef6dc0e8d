//! Control strategies: leak everything, or free immediately.
//!
//! Neither belongs in production. [`Leak`] establishes the upper bound on a
//! structure's own throughput (reclamation cost: zero) and doubles as proof
//! that payload corruption seen elsewhere is an ABA artifact — addresses
//! are never recycled, so ABA cannot occur. [`ImmediateDrop`] is the
//! opposite pole: it frees at retirement with no grace period, which makes
//! ABA and use-after-free visible the moment a concurrent reader exists.

use crate::reclaim::{DropFn, Reclaim};

/// No-op reclamation: retired pointers are abandoned.
///
/// Safe under any concurrency (nothing is ever freed) at the cost of
/// unbounded memory growth. Benchmark baseline only.
pub struct Leak;

// SAFETY: nothing is freed, so no reader can ever observe freed memory.
unsafe impl Reclaim for Leak {
    type Guard = ();

    #[inline]
    fn enter() -> Self::Guard {}

    #[inline]
    fn protect(_guard: &Self::Guard, _index: usize, _ptr: *mut ()) {}

    #[inline]
    unsafe fn retire(_ptr: *mut (), _drop_fn: DropFn) {
        // Intentionally abandoned.
    }

    #[inline]
    fn quiescent() {}
}

/// Immediate reclamation: the deleter runs inside `retire`.
///
/// This deliberately violates the [`Reclaim`] grace-period contract. With
/// the node pool enabled, freed addresses recycle instantly and a
/// concurrent workload will exhibit ABA (count mismatches, or aborts under
/// a sanitizer) — which is precisely its job as a negative control.
///
/// Sound only when no other thread can hold the retired pointer: single
/// threaded use, or structures torn down behind an external barrier.
pub struct ImmediateDrop;

// SAFETY: not upheld in general — see the type docs. The impl exists so the
// negative control monomorphizes like the real strategies; callers opt into
// the hazard knowingly.
unsafe impl Reclaim for ImmediateDrop {
    type Guard = ();

    #[inline]
    fn enter() -> Self::Guard {}

    #[inline]
    fn protect(_guard: &Self::Guard, _index: usize, _ptr: *mut ()) {}

    #[inline]
    unsafe fn retire(ptr: *mut (), drop_fn: DropFn) {
        // SAFETY: caller accepts the strategy's single-threaded contract.
        unsafe { drop_fn(ptr) }
    }

    #[inline]
    fn quiescent() {}
}
