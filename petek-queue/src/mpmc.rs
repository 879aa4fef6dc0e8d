//! Unbounded MPMC FIFO over a linked list of nodes, in the two-pointer
//! style of Michael and Scott.
//!
//! A dummy node is always present: `head` points at it, the first live
//! value sits in `head.next`, and an empty queue is simply `head.next ==
//! null`. Producers link at `tail` and swing it; consumers read the value
//! out of `head.next` and swing `head` onto it, retiring the old dummy to
//! the reclamation strategy. `tail` may lag the true last node by one link;
//! both sides help it forward, which is what makes the queue lock-free — a
//! producer preempted between linking and swinging cannot block anyone.
//!
//! The queue is generic over a [`Reclaim`] strategy and monomorphizes per
//! strategy. Node storage comes from [`petek::pool`]; retired nodes flow
//! back into it through the strategy's deleter, never around it.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use petek::{pool, Backoff, Hazard, Reclaim};

use crate::utils::CacheAligned;

#[repr(C)]
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
}

impl<T> Node<T> {
    #[inline]
    fn layout() -> Layout {
        Layout::new::<Node<T>>()
    }

    /// A fresh, unlinked node carrying `value`.
    fn alloc(value: T) -> *mut Node<T> {
        let node = pool::alloc(Self::layout()).cast::<Node<T>>().as_ptr();
        // SAFETY: the pool handed us writable storage for one Node<T>;
        // both fields are initialized before the pointer escapes.
        unsafe {
            ptr::addr_of_mut!((*node).next).write(AtomicPtr::new(ptr::null_mut()));
            ptr::addr_of_mut!((*node).value).write(MaybeUninit::new(value));
        }
        node
    }

    /// The sentinel: no value, null link.
    fn alloc_dummy() -> *mut Node<T> {
        let node = pool::alloc(Self::layout()).cast::<Node<T>>().as_ptr();
        // SAFETY: as in alloc; the value slot intentionally stays
        // uninitialized, nobody reads a dummy's value.
        unsafe {
            ptr::addr_of_mut!((*node).next).write(AtomicPtr::new(ptr::null_mut()));
        }
        node
    }

    /// Deleter handed to the reclamation strategy. Retired nodes have
    /// always had their value moved out, so only the storage returns.
    unsafe fn free_storage(node: *mut ()) {
        // SAFETY: node came out of pool::alloc with this layout and is not
        // null; the caller owns it exclusively.
        unsafe { pool::dealloc(NonNull::new_unchecked(node.cast()), Self::layout()) };
    }

    /// Free a node that still carries a live value (unpublished nodes and
    /// drop-time drain).
    unsafe fn free_with_value(node: *mut Node<T>) {
        // SAFETY: caller owns the node exclusively and its value slot is
        // initialized.
        unsafe {
            ptr::drop_in_place((*node).value.as_mut_ptr());
            Self::free_storage(node.cast());
        }
    }
}

/// An unbounded multi-producer multi-consumer FIFO queue.
///
/// `R` selects the memory-reclamation strategy; see [`HazardQueue`],
/// [`EpochQueue`] and [`LeakQueue`] for the common instantiations.
///
/// Per-producer order is preserved; consumers observe one global
/// linearization of all enqueues. `try_dequeue` never blocks, and a closed
/// queue keeps draining until empty.
pub struct MpmcQueue<T, R: Reclaim = Hazard> {
    head: CacheAligned<AtomicPtr<Node<T>>>,
    tail: CacheAligned<AtomicPtr<Node<T>>>,
    closed: CacheAligned<AtomicBool>,
    _reclaim: PhantomData<R>,
}

// SAFETY: values cross threads through the queue, so T: Send is required;
// the queue's own state is all atomics coordinated by the protocols below.
unsafe impl<T: Send, R: Reclaim> Send for MpmcQueue<T, R> {}
unsafe impl<T: Send, R: Reclaim> Sync for MpmcQueue<T, R> {}

impl<T, R: Reclaim> MpmcQueue<T, R> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let dummy = Node::<T>::alloc_dummy();
        Self {
            head: CacheAligned::new(AtomicPtr::new(dummy)),
            tail: CacheAligned::new(AtomicPtr::new(dummy)),
            closed: CacheAligned::new(AtomicBool::new(false)),
            _reclaim: PhantomData,
        }
    }

    /// Creates an empty queue, ignoring the capacity hint.
    ///
    /// The queue is unbounded; the hint exists for signature parity with
    /// bounded implementations so callers can swap them freely.
    pub fn with_capacity(_capacity_hint: usize) -> Self {
        Self::new()
    }

    /// Appends `value`. Returns `false` — dropping `value` — iff the queue
    /// was observed closed.
    pub fn enqueue(&self, value: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let node = Node::alloc(value);
        let guard = R::enter();
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            R::protect(&guard, 0, tail.cast());
            // The protect/re-validate handshake: only a tail still
            // installed after the publish is safe to dereference.
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // Re-check before linking; racing enqueues that already linked
            // are allowed to complete.
            if self.closed.load(Ordering::Acquire) {
                drop(guard);
                // SAFETY: the node never became reachable.
                unsafe { Node::free_with_value(node) };
                return false;
            }

            // SAFETY: tail is protected and re-validated above.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                // SAFETY: as above; linking publishes the initialized node.
                let linked = unsafe {
                    (*tail)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                };
                if linked {
                    // Best-effort swing; a helper may win it, which is fine.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return true;
                }
                backoff.pause();
            } else {
                // Tail lags behind a linked node; help it forward so a
                // stalled producer cannot wedge the queue.
                if self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    backoff.pause();
                }
            }
        }
    }

    /// Removes the oldest value, or returns `None` when the queue is
    /// observed empty. Never blocks; keeps draining after [`close`].
    ///
    /// [`close`]: MpmcQueue::close
    pub fn try_dequeue(&self) -> Option<T> {
        let guard = R::enter();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire);
            R::protect(&guard, 0, head.cast());
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head is protected and re-validated above.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Empty. The guard clears any protection on drop.
                return None;
            }

            R::protect(&guard, 1, next.cast());
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if head == tail {
                // Next exists but tail still points at the dummy: help.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                backoff.pause();
                continue;
            }

            // The value must be read before the swing: after a successful
            // CAS this thread has no claim on either node. Losers forget
            // their bitwise copy.
            // SAFETY: next is protected; the slot is initialized (it is a
            // linked non-dummy node) and only ever read concurrently.
            let value = unsafe { ptr::read((*next).value.as_ptr()) };
            match self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    drop(guard);
                    // SAFETY: the old dummy is unlinked, its value slot was
                    // vacated when it was consumed (or never filled).
                    unsafe { R::retire(head.cast(), Node::<T>::free_storage) };
                    return Some(value);
                }
                Err(_) => {
                    mem::forget(value);
                    backoff.pause();
                }
            }
        }
    }

    /// Closes the queue. Idempotent; subsequent enqueues fail while
    /// consumers drain what is already linked.
    ///
    /// A drain is complete only once a consumer observes an empty
    /// [`try_dequeue`](MpmcQueue::try_dequeue) *after* seeing
    /// [`is_closed`](MpmcQueue::is_closed) return true — an empty
    /// observation taken before that may race an item linked just ahead of
    /// the close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](MpmcQueue::close) has been observed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Declares that the calling thread holds no pointers derived from
    /// this queue, letting the reclamation strategy advance.
    ///
    /// Cheap. Epoch-based strategies need this called at a coarse interval
    /// (say every 64 operations) on threads that dequeue in a tight loop;
    /// for hazard pointers it is optional and for [`Leak`](petek::Leak) a
    /// no-op.
    pub fn quiescent(&self) {
        R::quiescent();
    }
}

impl<T, R: Reclaim> Default for MpmcQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: Reclaim> Drop for MpmcQueue<T, R> {
    fn drop(&mut self) {
        // Exclusive access: free the dummy (vacant value slot), then every
        // remaining node with its value. Nodes already retired belong to
        // the strategy and are not reachable from head.
        let mut cursor = self.head.load(Ordering::Relaxed);
        let mut at_dummy = true;
        while !cursor.is_null() {
            // SAFETY: we own the whole chain during drop.
            let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
            if at_dummy {
                // SAFETY: the node at head never carries a value.
                unsafe { Node::<T>::free_storage(cursor.cast()) };
                at_dummy = false;
            } else {
                // SAFETY: linked non-dummy nodes carry initialized values.
                unsafe { Node::free_with_value(cursor) };
            }
            cursor = next;
        }
    }
}

/// [`MpmcQueue`] reclaiming through hazard pointers.
pub type HazardQueue<T> = MpmcQueue<T, petek::Hazard>;

/// [`MpmcQueue`] reclaiming through epochs. Remember to call
/// [`quiescent`](MpmcQueue::quiescent) on busy consumers.
pub type EpochQueue<T> = MpmcQueue<T, petek::Epoch>;

/// [`MpmcQueue`] that never reclaims. Throughput baseline.
pub type LeakQueue<T> = MpmcQueue<T, petek::Leak>;
