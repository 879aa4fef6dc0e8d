//! Hazard-pointer reclamation.
//!
//! Every participating thread owns a record on a global, append-only list.
//! A record carries [`SLOTS`] publicly readable slots; publishing a pointer
//! into a slot forbids every other thread from freeing it. Retired pointers
//! accumulate in a thread-local buffer; once the buffer reaches
//! [`SCAN_THRESHOLD`] entries the thread snapshots all published hazards,
//! sorts them, and frees every retiree that is not in the snapshot.
//!
//! The publish/validate handshake carries the safety argument: a hazard is
//! published with SeqCst, and the queue re-reads the pointer's source before
//! the first dereference. A scan therefore either observes the hazard, or
//! the pointer was retired before the reader could have re-validated it —
//! in both cases no protected pointer is freed.
//!
//! Records are never deallocated. A thread that exits clears its slots and
//! drops its claim; the record is recycled by the next thread that
//! registers. Residual retirees of an exiting thread move to a global
//! orphan list that later scans drain.

use crate::reclaim::{DropFn, Reclaim, Retired};
use crate::ttas::TTas;
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;

/// Hazard slots per thread. Two suffice for a two-pointer queue: the node
/// being unlinked and its successor.
pub const SLOTS: usize = 2;

/// Retirement buffer size that triggers a scan.
const SCAN_THRESHOLD: usize = 128;

/// Per-thread record on the global list.
///
/// The slots and the claim flag sit on separate cache lines so a thread
/// publishing hazards does not collide with registration traffic.
struct HazardRecord {
    slots: CachePadded<[AtomicPtr<()>; SLOTS]>,
    acquired: CachePadded<AtomicBool>,
    /// Next record; written once before the record is published.
    next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    fn new() -> Self {
        Self {
            slots: CachePadded::new([(); SLOTS].map(|_| AtomicPtr::new(ptr::null_mut()))),
            acquired: CachePadded::new(AtomicBool::new(true)),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

struct HazardState {
    head: AtomicPtr<HazardRecord>,
    /// Retirees inherited from exited threads, drained by later scans.
    orphans: TTas<Vec<Retired>>,
}

impl HazardState {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            orphans: TTas::new(Vec::new()),
        }
    }
}

/// Global singleton instance, first-touch initialized and never dropped.
static GLOBAL: OnceBox<HazardState> = OnceBox::new();

#[inline]
fn global() -> &'static HazardState {
    GLOBAL.get_or_init(|| Box::new(HazardState::new()))
}

/// Claim a record: recycle a released one or push a fresh one.
fn register(state: &'static HazardState) -> &'static HazardRecord {
    let mut cursor = state.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: records are never freed.
        let record = unsafe { &*cursor };
        if !record.acquired.load(Ordering::Relaxed)
            && record
                .acquired
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return record;
        }
        cursor = record.next.load(Ordering::Acquire);
    }

    let fresh = Box::into_raw(Box::new(HazardRecord::new()));
    loop {
        let head = state.head.load(Ordering::Acquire);
        // SAFETY: fresh is unpublished; we are its only owner until the CAS.
        unsafe { (*fresh).next.store(head, Ordering::Relaxed) };
        if state
            .head
            .compare_exchange(head, fresh, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: published records are never freed.
            return unsafe { &*fresh };
        }
    }
}

/// Drop a record's claim so another thread can recycle it.
fn release(record: &HazardRecord) {
    for slot in record.slots.iter() {
        slot.store(ptr::null_mut(), Ordering::Release);
    }
    record.acquired.store(false, Ordering::Release);
}

/// Snapshot all hazards and free every unprotected retiree in `retired`.
fn scan(retired: &mut Vec<Retired>) {
    let state = global();

    // Absorb orphans from exited threads when the list is uncontended.
    if let Some(mut orphans) = state.orphans.try_lock() {
        retired.append(&mut orphans);
    }

    let mut hazards: Vec<*mut ()> = Vec::with_capacity(SLOTS * 16);
    let mut cursor = state.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        // SAFETY: records are never freed.
        let record = unsafe { &*cursor };
        for slot in record.slots.iter() {
            let ptr = slot.load(Ordering::SeqCst);
            if !ptr.is_null() {
                hazards.push(ptr);
            }
        }
        cursor = record.next.load(Ordering::Acquire);
    }
    hazards.sort_unstable();

    let mut kept = Vec::new();
    for record in retired.drain(..) {
        if hazards.binary_search(&record.ptr).is_ok() {
            kept.push(record);
        } else {
            // SAFETY: the pointer is retired (unlinked, owned by us) and no
            // thread had it published when the snapshot was taken.
            unsafe { record.reclaim() };
        }
    }
    *retired = kept;
}

/// Thread-local participation state.
struct HazardHandle {
    record: Cell<Option<&'static HazardRecord>>,
    retired: RefCell<Vec<Retired>>,
}

impl HazardHandle {
    const fn new() -> Self {
        Self {
            record: Cell::new(None),
            retired: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    fn record(&self) -> &'static HazardRecord {
        match self.record.get() {
            Some(record) => record,
            None => {
                let record = register(global());
                self.record.set(Some(record));
                record
            }
        }
    }

    fn retire(&self, record: Retired) {
        let mut retired = self.retired.borrow_mut();
        retired.push(record);
        if retired.len() >= SCAN_THRESHOLD {
            scan(&mut retired);
        }
    }

    fn quiescent(&self) {
        if let Some(record) = self.record.get() {
            for slot in record.slots.iter() {
                slot.store(ptr::null_mut(), Ordering::Release);
            }
        }
        let mut retired = self.retired.borrow_mut();
        if !retired.is_empty() {
            scan(&mut retired);
        }
    }
}

impl Drop for HazardHandle {
    fn drop(&mut self) {
        let retired = self.retired.get_mut();
        // One final scan; whatever survives is still hazarded by someone and
        // goes to the orphan list rather than leaking silently.
        if !retired.is_empty() {
            scan(retired);
        }
        if !retired.is_empty() {
            global().orphans.lock().append(retired);
        }
        if let Some(record) = self.record.get() {
            release(record);
        }
    }
}

std::thread_local! {
    static HANDLE: HazardHandle = const { HazardHandle::new() };
}

/// Critical-section token for [`Hazard`]. Dropping it clears both slots.
pub struct HazardGuard {
    record: &'static HazardRecord,
    /// Set when the guard was created during TLS teardown and owns a
    /// record claimed just for this critical section.
    transient: bool,
    /// Guards release per-thread state; they must not travel.
    _not_send: PhantomData<*mut ()>,
}

impl Drop for HazardGuard {
    #[inline]
    fn drop(&mut self) {
        if self.transient {
            release(self.record);
        } else {
            for slot in self.record.slots.iter() {
                slot.store(ptr::null_mut(), Ordering::Release);
            }
        }
    }
}

/// Hazard-pointer strategy.
///
/// Readers pay one SeqCst store plus a re-validation load per protected
/// pointer; reclamation is bounded (at most `SLOTS` pointers per thread are
/// ever withheld from a scan).
pub struct Hazard;

// SAFETY: a pointer is freed only when a post-retirement snapshot of every
// published slot misses it; together with publish-then-revalidate on the
// reader side this keeps every reachable pointer alive.
unsafe impl Reclaim for Hazard {
    type Guard = HazardGuard;

    #[inline]
    fn enter() -> HazardGuard {
        HANDLE
            .try_with(|handle| HazardGuard {
                record: handle.record(),
                transient: false,
                _not_send: PhantomData,
            })
            // TLS teardown: claim a record for just this critical section.
            .unwrap_or_else(|_| HazardGuard {
                record: register(global()),
                transient: true,
                _not_send: PhantomData,
            })
    }

    #[inline]
    fn protect(guard: &HazardGuard, index: usize, ptr: *mut ()) {
        if index < SLOTS {
            guard.record.slots[index].store(ptr, Ordering::SeqCst);
        }
    }

    unsafe fn retire(ptr: *mut (), drop_fn: DropFn) {
        let mut pending = Some(Retired::new(ptr, drop_fn));
        let _ = HANDLE.try_with(|handle| {
            if let Some(record) = pending.take() {
                handle.retire(record);
            }
        });
        if let Some(record) = pending {
            // TLS torn down; forward to the orphan list.
            global().orphans.lock().push(record);
        }
    }

    fn quiescent() {
        let _ = HANDLE.try_with(|handle| handle.quiescent());
    }
}

/// Number of retirees buffered by the current thread, awaiting a scan.
pub fn pending() -> usize {
    HANDLE
        .try_with(|handle| handle.retired.borrow().len())
        .unwrap_or(0)
}
