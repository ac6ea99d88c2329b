//! Pool types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`Pool`](struct.Pool.html)
//!
//! A `Pool` is a single-threaded block allocator over memory handed to it by
//! a `RegionProvider`. It is initialized once with a region size and a
//! placement [`Strategy`](../strategy/enum.Strategy.html), and grows by
//! asking its provider for more memory when no free block fits.
//!
//! ### [`LockedPool`](struct.LockedPool.html)
//!
//! A `LockedPool` wraps a `Pool` with a spin lock to make it thread-safe,
//! and implements `GlobalAlloc` on top of it.
//!
//! ### [`RegionProvider`](trait.RegionProvider.html)
//!
//! `RegionProvider` is a simple trait interface meant to abstract over the
//! calls to the OS to reserve memory.
//!
//! ### [`MmapRegions`](struct.MmapRegions.html)
//!
//! Reserves anonymous private mappings through `libc::mmap`.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `RegionProvider` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;
use log::{debug, trace};
use spin::Mutex;

use crate::blocklist::{Block, BlockInfo, BlockList, Stats, Validity, ALIGNMENT, HEADER_SIZE};
use crate::strategy::Strategy;
use crate::{PoolError, PoolResult};

/// Requests above this many bytes are refused outright.
pub const MAX_ALLOC_SIZE: usize = 10 * 1024 * 1024;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

// As round_up, but None instead of overflowing.
fn checked_round_up(value: usize, increment: usize) -> Option<usize> {
    value
        .checked_add(increment - 1)
        .map(|v| v / increment * increment)
}

pub trait RegionProvider {
    type Err: fmt::Debug;

    /// Reserve at least `size` bytes. Returns a pointer and the number of
    /// bytes actually available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this module, the
    /// returned memory must be:
    ///
    /// - at least `size` bytes, zeroed, readable and writable
    /// - aligned to at least `ALIGNMENT`
    /// - untracked by any other rust code, including the provider itself
    unsafe fn reserve(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Reserve more memory once the first region is exhausted.
    ///
    /// This is a fresh reservation, not a resize: the result need not be
    /// adjacent to anything handed out before.
    ///
    /// # Safety
    ///
    /// Same as `reserve`.
    unsafe fn extend(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        self.reserve(size)
    }
}

/// MmapRegions uses virtual memory to reserve regions upon request.
///
/// Mappings are never unmapped.
#[derive(Default, Debug)]
pub struct MmapRegions {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

impl MmapRegions {
    pub const fn new() -> Self {
        MmapRegions {
            pages: 0,
            growths: 0,
        }
    }

    /// Pages mapped so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful `mmap` calls.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

impl RegionProvider for MmapRegions {
    type Err = Errno;

    unsafe fn reserve(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        if size == 0 {
            return Err(Errno(libc::EINVAL));
        }
        let pagesize = sysconf::page::pagesize();
        let to_allocate = checked_round_up(size, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: zero-filled memory, no file behind it.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((ptr, to_allocate))
    }
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed array handed out in `page_size` steps.
///
/// The pointers it returns point into the struct itself, so a `ToyHeap` (and
/// any `Pool` holding one) must not move after it has handed out memory.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    pub page_size: usize,
    pub size: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            page_size: 64,
            size: 0,
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl RegionProvider for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn reserve(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        if size == 0 {
            return Err(ToyHeapOverflowError());
        }
        let allocating = checked_round_up(size, self.page_size)
            .and_then(|s| checked_round_up(s, ALIGNMENT))
            .ok_or(ToyHeapOverflowError())?;
        if allocating > self.heap.len() - self.size {
            return Err(ToyHeapOverflowError());
        }

        let ptr = NonNull::new_unchecked(self.heap.as_mut_ptr().add(self.size));
        self.size += allocating;
        Ok((ptr, allocating))
    }
}

/// A pool of blocks with a placement strategy.
///
/// A pool starts out uninitialized; [`init`](#method.init) reserves its first
/// region and can succeed only once. Allocations before `init` are served
/// by growing the heap directly.
///
/// Note: It never returns memory to the OS, and never merges neighbouring
/// free blocks.
pub struct Pool<P> {
    provider: P,
    // Start of the region reserved by `init`.
    base: Option<NonNull<u8>>,
    blocks: BlockList,
    strategy: Strategy,
    // The block most recently chosen by a next-fit search.
    cursor: Option<Block>,
}

// The chain is only reachable through the pool, so it moves between threads
// with it.
unsafe impl<P: Send> Send for Pool<P> {}

impl<P: RegionProvider + Default> Default for Pool<P> {
    fn default() -> Self {
        Pool::new(P::default())
    }
}

impl<P> Pool<P> {
    /// Create an uninitialized pool.
    pub const fn new(provider: P) -> Self {
        Pool {
            provider,
            base: None,
            blocks: BlockList::new(),
            strategy: Strategy::FirstFit,
            cursor: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Every block from head to tail, with its address, size and free flag.
    pub fn dump(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().map(BlockInfo::from)
    }

    /// Get statistics on this pool, and verify validity of the chain.
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// Mark the block behind `ptr` free.
    ///
    /// A null pointer, a misaligned one, or one whose header lacks the magic
    /// word is refused with `InvalidFree`. Freeing the same pointer twice is
    /// not detected and succeeds both times. Neighbouring free blocks are not
    /// merged.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by `alloc` on this pool. The
    /// magic check reads the header in front of `ptr`, so a foreign pointer
    /// is still undefined behavior.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> PoolResult {
        let ptr = NonNull::new(ptr).ok_or(PoolError::InvalidFree)?;
        if ptr.as_ptr() as usize % ALIGNMENT != 0 {
            return Err(PoolError::InvalidFree);
        }

        let mut block = Block::from_payload(ptr);
        if !block.has_magic() {
            debug!("Refusing to free {:?}: no block header", ptr);
            return Err(PoolError::InvalidFree);
        }

        trace!("Freeing {:?}", block);
        block.set_free(true);
        Ok(())
    }
}

impl<P: RegionProvider> Pool<P> {
    /// Reserve `region_size` bytes and install them as one free block, using
    /// `strategy` for every later allocation.
    ///
    /// Fails with `DoubleInit` if the pool was initialized before, with
    /// `InvalidSize` if the region cannot hold a header, and with
    /// `ReservationFailure` if the provider has no memory. A failed `init`
    /// changes nothing.
    pub fn init(&mut self, region_size: usize, strategy: Strategy) -> PoolResult {
        if self.is_initialized() {
            return Err(PoolError::DoubleInit);
        }
        if region_size <= HEADER_SIZE {
            return Err(PoolError::InvalidSize);
        }

        let (ptr, granted) = unsafe { self.provider.reserve(region_size) }.map_err(|err| {
            debug!("Failed to reserve {} bytes: {:?}", region_size, err);
            PoolError::ReservationFailure
        })?;

        let block = unsafe { Block::from_raw(ptr, region_size - HEADER_SIZE, true) };
        // Blocks grown before init stay reachable after the region block.
        self.blocks.push_front(block);
        self.base = Some(ptr);
        self.strategy = strategy;
        self.cursor = None;

        debug!(
            "Initialized {} pool at {:?}: {} bytes ({} granted)",
            strategy, ptr, region_size, granted
        );
        Ok(())
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    ///
    /// Returns `None` for `size == 0`, for `size > MAX_ALLOC_SIZE`, and when
    /// the provider runs out of memory.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            trace!("Refusing to allocate {} bytes", size);
            return None;
        }
        let size = round_up(size, ALIGNMENT);

        let mut block = if self.blocks.is_empty() {
            self.grow(size)?
        } else {
            match self.strategy.select(&self.blocks, size, self.cursor) {
                Some(found) => {
                    if self.strategy == Strategy::NextFit {
                        self.cursor = Some(found);
                    }
                    self.blocks.split(found, size);
                    found
                }
                None => self.grow(size)?,
            }
        };

        let ptr = block.aligned_payload();
        block.set_free(false);
        trace!("Allocated {} bytes at {:?}", size, ptr);
        Some(ptr)
    }

    // Append a new used block of `size` payload bytes at the tail.
    fn grow(&mut self, size: usize) -> Option<Block> {
        let needed = size + HEADER_SIZE;
        let (ptr, granted) = match unsafe { self.provider.extend(needed) } {
            Ok(res) => res,
            Err(err) => {
                debug!("Failed to grow pool by {} bytes: {:?}", needed, err);
                return None;
            }
        };

        // Anything granted past `needed` is left untracked.
        debug!(
            "Grew pool by {} bytes at {:?} ({} granted)",
            needed, ptr, granted
        );
        let block = unsafe { Block::from_raw(ptr, size, false) };
        self.blocks.push_back(block);
        Some(block)
    }
}

impl<P> fmt::Display for Pool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({}, {})", self.strategy, self.blocks)
    }
}

/// A thread-safe pool, using a spin lock around a `Pool`.
///
/// The whole engine sits behind a single lock. When a `LockedPool` is the
/// global allocator, the installed logger must not allocate, or the first
/// log line from inside the pool deadlocks.
pub struct LockedPool<P> {
    pool: Mutex<Pool<P>>,
}

impl<P> LockedPool<P> {
    pub const fn new(provider: P) -> Self {
        LockedPool {
            pool: Mutex::new(Pool::new(provider)),
        }
    }
}

impl<P: RegionProvider + Default> Default for LockedPool<P> {
    fn default() -> Self {
        LockedPool::new(P::default())
    }
}

impl<P: RegionProvider> LockedPool<P> {
    pub fn init(&self, region_size: usize, strategy: Strategy) -> PoolResult {
        self.pool.lock().init(region_size, strategy)
    }

    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.pool.lock().alloc(size)
    }

    /// # Safety
    ///
    /// See [`Pool::free`](struct.Pool.html#method.free).
    pub unsafe fn free(&self, ptr: *mut u8) -> PoolResult {
        self.pool.lock().free(ptr)
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.pool.lock().stats()
    }

    /// Run `f` with the lock held.
    pub fn with<R, F: FnOnce(&mut Pool<P>) -> R>(&self, f: F) -> R {
        f(&mut self.pool.lock())
    }
}

unsafe impl<P: RegionProvider> GlobalAlloc for LockedPool<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.pool
            .lock()
            .alloc(layout.size())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Nothing useful to do with a refused pointer here.
        let _ = self.pool.lock().free(ptr);
    }
}
