//! Queue primitives built on petek's pluggable memory reclamation.
//!
//! ## Features
//!
//! - [`MpmcQueue`]: unbounded MPMC FIFO (Michael–Scott), generic over the
//!   reclamation strategy.
//! - [`HazardQueue`], [`EpochQueue`], [`LeakQueue`]: the common
//!   instantiations.
//!
//! ## Usage
//!
//! ```rust
//! use petek_queue::HazardQueue;
//!
//! let q = HazardQueue::new();
//! assert!(q.enqueue(7));
//! assert_eq!(q.try_dequeue(), Some(7));
//! q.close();
//! assert!(!q.enqueue(8));
//! ```

pub mod mpmc;
pub mod utils;

pub use mpmc::{EpochQueue, HazardQueue, LeakQueue, MpmcQueue};
