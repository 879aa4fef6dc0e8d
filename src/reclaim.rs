//! The reclamation capability and the retirement record.
//!
//! A queue (or any lock-free structure) is generic over a [`Reclaim`]
//! implementation and is monomorphized per strategy — there is no virtual
//! dispatch on the hot path. The strategies shipped here are
//! [`Hazard`](crate::Hazard), [`Epoch`](crate::Epoch),
//! [`Leak`](crate::Leak) and [`ImmediateDrop`](crate::ImmediateDrop).

/// Type-erased deleter invoked when a retired pointer becomes unreachable.
///
/// For pooled nodes this returns the storage to the pool rather than the OS;
/// the strategy never needs to know the pointee type.
pub type DropFn = unsafe fn(*mut ());

/// A retired pointer paired with its deleter.
///
/// Ownership of the pointee transfers to the reclamation strategy when the
/// record is created and leaves it when the deleter runs.
pub struct Retired {
    pub(crate) ptr: *mut (),
    pub(crate) drop_fn: DropFn,
}

impl Retired {
    pub(crate) fn new(ptr: *mut (), drop_fn: DropFn) -> Self {
        Self { ptr, drop_fn }
    }

    /// Run the deleter, consuming the record.
    ///
    /// # Safety
    ///
    /// The pointee must be unreachable by every other thread: not published
    /// in any hazard slot and not observable from any epoch critical section
    /// that predates its retirement.
    #[inline]
    pub(crate) unsafe fn reclaim(self) {
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

// SAFETY: a Retired is an owned, unlinked allocation; the raw pointer is the
// only handle left and moving it across threads (orphan lists) is fine.
unsafe impl Send for Retired {}

/// A pluggable safe-memory-reclamation strategy.
///
/// The contract mirrors what a lock-free reader needs:
///
/// 1. [`enter`](Reclaim::enter) opens a critical section and returns a guard;
///    dropping the guard closes it.
/// 2. [`protect`](Reclaim::protect) publishes a pointer in a per-thread slot
///    (hazard pointers); epoch-style strategies treat it as a no-op. Callers
///    must re-validate the pointer's source after protecting, before the
///    first dereference.
/// 3. [`retire`](Reclaim::retire) hands over an unlinked pointer together
///    with a deleter; the strategy runs the deleter once the pointer is
///    provably unreachable.
/// 4. [`quiescent`](Reclaim::quiescent) is an advisory hook: the calling
///    thread declares it holds no protected pointers, letting the strategy
///    advance reclamation. Epoch-based strategies need it called at a coarse
///    interval on otherwise-idle consumers to make progress.
///
/// # Safety
///
/// An implementation must not run a deleter while any thread can still reach
/// the pointer under the protocol above. [`ImmediateDrop`](crate::ImmediateDrop)
/// intentionally violates this for single-threaded negative tests; see its
/// docs before reaching for it.
pub unsafe trait Reclaim {
    /// Critical-section token. Dropping it releases any per-thread
    /// protection taken during the section.
    type Guard;

    /// Open a critical section.
    fn enter() -> Self::Guard;

    /// Publish `ptr` in protection slot `index`.
    ///
    /// Hazard-pointer specific; other strategies compile this away. Slot
    /// indices at or above the strategy's slot count are ignored.
    fn protect(guard: &Self::Guard, index: usize, ptr: *mut ());

    /// Transfer ownership of an unlinked pointer to the strategy.
    ///
    /// # Safety
    ///
    /// - `ptr` must be unlinked: no new references to it can be created
    ///   through the data structure after this call.
    /// - `ptr` must be retired at most once.
    /// - `drop_fn(ptr)` must be sound to call once the strategy decides the
    ///   pointer is unreachable.
    unsafe fn retire(ptr: *mut (), drop_fn: DropFn);

    /// Declare a quiescent state for the calling thread.
    fn quiescent();
}
