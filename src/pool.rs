//! Size-classed block pool backing node allocation.
//!
//! Lock-free queues burn through small, identically-sized nodes; routing
//! every one through the OS allocator puts a global lock on the hot path.
//! The pool keeps a per-thread magazine of free blocks per size class and a
//! shared stack per class behind a [`TTas`] lock, moving blocks between the
//! two in batches of [`BATCH`]. The OS is only consulted when both tiers are
//! empty, and that call site is counted so tests can bound it.
//!
//! The SMR boundary is honored by construction: strategies free retired
//! nodes through [`dealloc`], so a retired block re-enters circulation only
//! after its strategy has proven it unreachable.
//!
//! Layouts above [`CLASS_MAX`] bytes or over-aligned past 16 bypass the
//! cache. With the `pool` feature off everything bypasses it; the OS call
//! site (and its counters) stays the same either way.

use crate::ttas::TTas;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use once_cell::race::OnceBox;

/// Smallest cached block.
const CLASS_MIN: usize = 32;
/// Largest cached block; bigger layouts go to the OS directly.
const CLASS_MAX: usize = 1024;
/// Power-of-two classes: 32, 64, 128, 256, 512, 1024.
const NUM_CLASSES: usize = 6;
/// Alignment of every cached block. Over-aligned layouts bypass the cache.
const CLASS_ALIGN: usize = 16;

/// Blocks moved per global<->local transfer.
#[cfg(feature = "pool")]
const BATCH: usize = 128;
/// Local magazine high-water mark; crossing it spills a batch to the
/// global stack.
#[cfg(feature = "pool")]
const LOCAL_CAP: usize = 4096;

/// Fill byte for blocks parked in the cache.
#[cfg(all(feature = "pool", feature = "poison"))]
const POISON: u8 = 0xEF;

/// A free block in a magazine or global stack.
struct RawBlock(NonNull<u8>);

// SAFETY: a free block has no owner besides the pool; moving the pointer
// between threads through the global stacks is the whole point.
unsafe impl Send for RawBlock {}

struct PoolState {
    classes: [TTas<Vec<RawBlock>>; NUM_CLASSES],
    os_allocs: AtomicUsize,
    os_frees: AtomicUsize,
}

impl PoolState {
    fn new() -> Self {
        Self {
            classes: [(); NUM_CLASSES].map(|_| TTas::new(Vec::new())),
            os_allocs: AtomicUsize::new(0),
            os_frees: AtomicUsize::new(0),
        }
    }
}

/// Global singleton instance, first-touch initialized and never dropped so
/// it outlives every SMR strategy and queue.
static GLOBAL: OnceBox<PoolState> = OnceBox::new();

#[inline]
fn global() -> &'static PoolState {
    GLOBAL.get_or_init(|| Box::new(PoolState::new()))
}

/// Counters around the pool's OS call site.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Blocks requested from the OS allocator.
    pub os_allocs: usize,
    /// Blocks returned to the OS allocator.
    pub os_frees: usize,
}

/// Snapshot of the OS-call counters.
pub fn stats() -> PoolStats {
    let state = global();
    PoolStats {
        os_allocs: state.os_allocs.load(Ordering::Relaxed),
        os_frees: state.os_frees.load(Ordering::Relaxed),
    }
}

/// Size class for `layout`, or `None` when it must bypass the cache.
#[cfg_attr(not(feature = "pool"), allow(dead_code))]
#[inline]
fn class_index(layout: Layout) -> Option<usize> {
    if layout.align() > CLASS_ALIGN || layout.size() > CLASS_MAX {
        return None;
    }
    let size = layout.size().max(CLASS_MIN).next_power_of_two();
    Some((size.trailing_zeros() - CLASS_MIN.trailing_zeros()) as usize)
}

#[cfg(feature = "pool")]
#[inline]
fn class_size(index: usize) -> usize {
    CLASS_MIN << index
}

#[cfg(feature = "pool")]
#[inline]
fn class_layout(index: usize) -> Layout {
    // SAFETY: class sizes are non-zero powers of two and CLASS_ALIGN is a
    // power of two not exceeding the size.
    unsafe { Layout::from_size_align_unchecked(class_size(index), CLASS_ALIGN) }
}

/// The single place raw memory is requested from the OS.
fn os_alloc(layout: Layout) -> NonNull<u8> {
    global().os_allocs.fetch_add(1, Ordering::Relaxed);
    // SAFETY: callers never pass a zero-sized layout (asserted in alloc).
    let ptr = unsafe { std::alloc::alloc(layout) };
    match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => std::alloc::handle_alloc_error(layout),
    }
}

/// The single place raw memory is returned to the OS.
unsafe fn os_free(ptr: NonNull<u8>, layout: Layout) {
    global().os_frees.fetch_add(1, Ordering::Relaxed);
    // SAFETY: caller guarantees ptr came from os_alloc with this layout.
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}

/// Allocate a block for `layout`.
///
/// The returned storage is uninitialized. Aborts the process via
/// [`std::alloc::handle_alloc_error`] if the OS refuses memory.
pub fn alloc(layout: Layout) -> NonNull<u8> {
    assert!(layout.size() != 0, "pool: zero-sized layout");
    #[cfg(feature = "pool")]
    {
        if let Some(index) = class_index(layout) {
            return cached_alloc(index);
        }
    }
    os_alloc(layout)
}

/// Return a block allocated with [`alloc`] under the same `layout`.
///
/// # Safety
///
/// `ptr` must have come from [`alloc`] with an equal `layout` and must not
/// be used afterwards.
pub unsafe fn dealloc(ptr: NonNull<u8>, layout: Layout) {
    #[cfg(feature = "pool")]
    {
        if let Some(index) = class_index(layout) {
            return unsafe { cached_dealloc(ptr, index) };
        }
    }
    unsafe { os_free(ptr, layout) }
}

#[cfg(feature = "pool")]
mod cache {
    use super::*;
    use core::cell::RefCell;

    struct Magazines {
        classes: [Vec<RawBlock>; NUM_CLASSES],
    }

    impl Magazines {
        fn new() -> Self {
            Self {
                classes: [(); NUM_CLASSES].map(|_| Vec::new()),
            }
        }
    }

    impl Drop for Magazines {
        fn drop(&mut self) {
            // Thread exit: everything local goes back to the shared tier.
            let state = global();
            for (index, stack) in self.classes.iter_mut().enumerate() {
                if !stack.is_empty() {
                    state.classes[index].lock().append(stack);
                }
            }
        }
    }

    std::thread_local! {
        static MAGAZINES: RefCell<Magazines> = RefCell::new(Magazines::new());
    }

    pub(super) fn cached_alloc(index: usize) -> NonNull<u8> {
        MAGAZINES
            .try_with(|magazines| {
                let mut magazines = magazines.borrow_mut();
                let stack = &mut magazines.classes[index];
                if stack.is_empty() {
                    refill(index, stack);
                }
                match stack.pop() {
                    Some(block) => {
                        check_poison(&block, index);
                        block.0
                    }
                    None => os_alloc(class_layout(index)),
                }
            })
            // Liveness fallback: the thread is tearing down, its magazine is
            // gone. Straight to the OS.
            .unwrap_or_else(|_| os_alloc(class_layout(index)))
    }

    pub(super) unsafe fn cached_dealloc(ptr: NonNull<u8>, index: usize) {
        let result = MAGAZINES.try_with(|magazines| {
            let mut magazines = magazines.borrow_mut();
            let stack = &mut magazines.classes[index];
            fill_poison(ptr, index);
            stack.push(RawBlock(ptr));
            if stack.len() >= LOCAL_CAP {
                spill(index, stack);
            }
        });
        if result.is_err() {
            // Thread teardown; do not touch the dead magazine.
            unsafe { os_free(ptr, class_layout(index)) };
        }
    }

    /// Move up to BATCH blocks global -> local. Cold path under the lock.
    fn refill(index: usize, stack: &mut Vec<RawBlock>) {
        let mut shared = global().classes[index].lock();
        let take = shared.len().min(BATCH);
        let at = shared.len() - take;
        stack.extend(shared.drain(at..));
    }

    /// Move BATCH blocks local -> global. Cold path under the lock.
    fn spill(index: usize, stack: &mut Vec<RawBlock>) {
        let at = stack.len() - BATCH;
        global().classes[index].lock().extend(stack.drain(at..));
    }

    #[cfg(feature = "poison")]
    fn fill_poison(ptr: NonNull<u8>, index: usize) {
        // SAFETY: the block is free and class_size bytes are ours.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), POISON, class_size(index)) };
    }

    #[cfg(not(feature = "poison"))]
    fn fill_poison(_ptr: NonNull<u8>, _index: usize) {}

    #[cfg(feature = "poison")]
    fn check_poison(block: &RawBlock, index: usize) {
        // SAFETY: the block sat free in the cache; reading it back is sound.
        let bytes =
            unsafe { core::slice::from_raw_parts(block.0.as_ptr(), class_size(index)) };
        assert!(
            bytes.iter().all(|&b| b == POISON),
            "pool: freed block was written while cached (use-after-free)"
        );
    }

    #[cfg(not(feature = "poison"))]
    fn check_poison(_block: &RawBlock, _index: usize) {}
}

#[cfg(feature = "pool")]
use cache::{cached_alloc, cached_dealloc};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        let small = Layout::from_size_align(1, 1).unwrap();
        assert_eq!(class_index(small), Some(0));
        let exact = Layout::from_size_align(64, 8).unwrap();
        assert_eq!(class_index(exact), Some(1));
        let odd = Layout::from_size_align(65, 8).unwrap();
        assert_eq!(class_index(odd), Some(2));
        let top = Layout::from_size_align(1024, 16).unwrap();
        assert_eq!(class_index(top), Some(5));
    }

    #[test]
    fn test_bypass_for_large_or_overaligned() {
        let large = Layout::from_size_align(4096, 8).unwrap();
        assert_eq!(class_index(large), None);
        let aligned = Layout::from_size_align(64, 64).unwrap();
        assert_eq!(class_index(aligned), None);
    }

    #[test]
    fn test_os_path_counts() {
        let layout = Layout::from_size_align(8192, 8).unwrap();
        let before = stats();
        let ptr = alloc(layout);
        unsafe { dealloc(ptr, layout) };
        let after = stats();
        assert!(after.os_allocs > before.os_allocs);
        assert!(after.os_frees > before.os_frees);
    }

    #[cfg(feature = "pool")]
    #[test]
    fn test_cache_locality() {
        let layout = Layout::from_size_align(48, 8).unwrap();

        // Warm up: one round trip parks a block in the magazine.
        let ptr = alloc(layout);
        unsafe { dealloc(ptr, layout) };

        // Warm churn stays local. Other tests share the global counters, so
        // bound the delta by a worst-case refill count instead of zero.
        let before = stats();
        for _ in 0..10_000 {
            let ptr = alloc(layout);
            unsafe { dealloc(ptr, layout) };
        }
        let after = stats();
        assert!(
            after.os_allocs - before.os_allocs <= 64,
            "warm single-block churn reached the OS {} times",
            after.os_allocs - before.os_allocs
        );

        // Thread exit flushes the magazine to the shared tier; a later
        // refill must find those blocks.
        let exit_layout = Layout::from_size_align(512, 16).unwrap();
        std::thread::spawn(move || {
            let blocks: Vec<_> = (0..32).map(|_| alloc(exit_layout)).collect();
            for ptr in blocks {
                unsafe { dealloc(ptr, exit_layout) };
            }
        })
        .join()
        .unwrap();

        let before = stats();
        let ptr = alloc(exit_layout);
        unsafe { dealloc(ptr, exit_layout) };
        let after = stats();
        assert!(after.os_allocs - before.os_allocs <= 8);
    }
}
