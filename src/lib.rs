#![no_std]

//! A memory pool with pluggable block placement.
//!
//! A [`Pool`](allocators/struct.Pool.html) carves allocations out of one
//! reserved region, keeping a header in front of every block and every block
//! in a single chain. Which free block serves a request is decided by a
//! [`Strategy`](strategy/enum.Strategy.html): first-fit, best-fit,
//! worst-fit or next-fit. When nothing fits, the pool grows by reserving a
//! fresh region for just that request.
//!
//! ```no_run
//! use placement_alloc::{MmapRegions, Pool, Strategy};
//!
//! let mut pool = Pool::new(MmapRegions::new());
//! pool.init(1024 * 1024, Strategy::BestFit).unwrap();
//!
//! let ptr = pool.alloc(100).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 8, 0);
//! unsafe { pool.free(ptr.as_ptr()).unwrap() };
//!
//! for block in pool.dump() {
//!     println!("{}", block);
//! }
//! ```
//!
//! Freed blocks are never merged with their neighbours and memory is never
//! returned to the OS.

#[cfg(test)]
extern crate std;

use core::fmt;

pub mod allocators;
pub mod blocklist;
pub mod strategy;

pub use allocators::{
    LockedPool, MmapRegions, Pool, RegionProvider, ToyHeap, ToyHeapOverflowError, MAX_ALLOC_SIZE,
};
pub use blocklist::{BlockInfo, Stats, Validity, ALIGNMENT, HEADER_SIZE};
pub use strategy::{ParseStrategyError, Strategy};

/// The error type returned by pool operations.
///
/// Zero-sized and oversized allocations are not errors; `alloc` simply
/// returns `None` for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The region passed to `init` cannot hold a block header.
    InvalidSize,
    /// `init` was called on a pool that is already initialized.
    DoubleInit,
    /// The region provider could not supply memory.
    ReservationFailure,
    /// `free` was given a null pointer, or one without a block header.
    InvalidFree,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PoolError::InvalidSize => "region too small for a block header",
            PoolError::DoubleInit => "pool already initialized",
            PoolError::ReservationFailure => "region provider out of memory",
            PoolError::InvalidFree => "pointer was not allocated by this pool",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`PoolError`] as the error type.
pub type PoolResult<T = ()> = Result<T, PoolError>;
