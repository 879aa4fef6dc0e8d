//! Jittered exponential backoff for CAS retry loops.
//!
//! Failed CAS attempts under contention tend to re-collide in lockstep: the
//! losers all reload, recompute and retry on the same cache-line round trip.
//! Each `pause()` spins for a doubling number of relaxation cycles plus a
//! per-thread pseudo-random jitter, then escalates to a thread yield once
//! spinning stops paying off.
//!
//! Backoff costs latency when there is no contention, so the whole body is
//! behind the `backoff` feature; with the feature off `pause()` compiles to
//! nothing and the retry loop runs bare.

use core::cell::Cell;

/// Spin ceiling. Past this many relaxation cycles the thread yields and the
/// step resets.
#[cfg(feature = "backoff")]
const SPIN_MAX: u32 = 1024;

#[cfg(feature = "backoff")]
static SEED: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0x9E37_79B9_7F4A_7C15);

#[cfg(feature = "backoff")]
std::thread_local! {
    // xorshift64* state, seeded off a global counter so threads start
    // decorrelated without touching the clock.
    static RNG: Cell<u64> = Cell::new(
        SEED.fetch_add(0x9E37_79B9_7F4A_7C15, core::sync::atomic::Ordering::Relaxed) | 1,
    );
}

#[cfg(feature = "backoff")]
#[inline]
fn next_random() -> u64 {
    RNG.try_with(|rng| {
        let mut x = rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        rng.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
    .unwrap_or(1)
}

/// Per-loop backoff state. Create one outside the retry loop and call
/// [`pause`](Backoff::pause) after each failed attempt.
pub struct Backoff {
    #[cfg_attr(not(feature = "backoff"), allow(dead_code))]
    step: Cell<u32>,
}

impl Backoff {
    /// A fresh backoff at the minimum step.
    #[inline]
    pub fn new() -> Self {
        Self { step: Cell::new(1) }
    }

    /// Back off once: spin `step + jitter` relaxation cycles and double the
    /// step, or yield and reset once the step passes the spin ceiling.
    #[inline]
    pub fn pause(&self) {
        #[cfg(feature = "backoff")]
        {
            let step = self.step.get();
            if step <= SPIN_MAX {
                let jitter = (next_random() % u64::from(step)) as u32;
                for _ in 0..step + jitter {
                    core::hint::spin_loop();
                }
                self.step.set(step << 1);
            } else {
                std::thread::yield_now();
                self.step.set(1);
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "backoff"))]
mod tests {
    use super::*;

    #[test]
    fn test_step_doubles_then_resets() {
        let b = Backoff::new();
        assert_eq!(b.step.get(), 1);
        b.pause();
        assert_eq!(b.step.get(), 2);
        while b.step.get() <= SPIN_MAX {
            b.pause();
        }
        // Next pause yields and resets.
        b.pause();
        assert_eq!(b.step.get(), 1);
    }

    #[test]
    fn test_jitter_is_thread_local() {
        let a = next_random();
        let b = next_random();
        assert_ne!(a, b);
        let other = std::thread::spawn(next_random).join().unwrap();
        assert_ne!(a, other);
    }
}
