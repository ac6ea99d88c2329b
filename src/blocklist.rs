use core::fmt;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Every payload handed out by a pool starts on a multiple of this many bytes.
pub const ALIGNMENT: usize = 8;

/// Canary written into every header. `free` refuses pointers whose header
/// does not carry it.
pub const BLOCK_MAGIC: u32 = 0xA110_CA7E;

/// The header in front of every block, free or used.
///
/// `size` counts the payload bytes after the header, not the header itself.
///
/// We use C representation and align to 8 bytes so that a header placed on
/// an 8-byte boundary is followed by a payload on an 8-byte boundary.
#[repr(C, align(8))]
pub struct BlockHeader {
    size: usize,
    next: Option<NonNull<BlockHeader>>,
    free: bool,
    magic: u32,
}

/// Bytes of overhead in front of every payload.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::align_of::<BlockHeader>() == ALIGNMENT);

/// A `Block` is a handle to a header living inside pool memory.
///
/// Blocks are never removed from a chain once linked, so handles stay valid
/// for as long as the owning pool's memory does. That is what lets the
/// next-fit cursor hold on to one.
///
/// Invariants:
///
/// - `header` points to an initialized `BlockHeader`
/// - `header.next` is `None` or points to another initialized `BlockHeader`
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// A Block is sendable - as long as the whole chain moves with it, it's fine.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh header at `ptr` for a block with `size` payload bytes
    /// and no successor.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGNMENT` and point to at least
    /// `HEADER_SIZE + size` bytes of writable memory that nothing else
    /// tracks.
    #[allow(clippy::cast_ptr_alignment)]
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize, free: bool) -> Block {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        let header: NonNull<BlockHeader> = ptr.cast();
        core::ptr::write(
            header.as_ptr(),
            BlockHeader {
                size,
                next: None,
                free,
                magic: BLOCK_MAGIC,
            },
        );
        Block { header }
    }

    /// Recover the block in front of a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `Block::aligned_payload` on a
    /// block that is still mapped. Anything else is undefined behavior; the
    /// magic check merely catches common mistakes.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        let start = payload.as_ptr().sub(HEADER_SIZE);
        Block {
            header: NonNull::new_unchecked(start as *mut BlockHeader),
        }
    }

    /// Address of the header.
    pub fn address(&self) -> NonNull<u8> {
        self.header.cast()
    }

    /// First byte after the header.
    pub fn data_start(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header.as_ptr().add(1) as *mut u8) }
    }

    /// The header and payload, as a pointer range.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.header.as_ptr() as *const u8;
        start..start.wrapping_add(HEADER_SIZE + self.size())
    }

    /// Do the two blocks claim any of the same bytes?
    pub fn overlaps(&self, other: &Block) -> bool {
        let mine = self.as_range();
        let theirs = other.as_range();
        mine.start < theirs.end && theirs.start < mine.end
    }

    /// The payload size of the block, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    pub fn is_free(&self) -> bool {
        self.header_view().free
    }

    pub fn has_magic(&self) -> bool {
        self.header_view().magic == BLOCK_MAGIC
    }

    /// Is this block free and large enough for `size` bytes?
    pub fn fits(&self, size: usize) -> bool {
        self.is_free() && self.size() >= size
    }

    /// Get the next block over from this one.
    pub fn next(&self) -> Option<Block> {
        self.header_view()
            .next
            .map(|header| Block { header })
    }

    pub fn set_free(&mut self, free: bool) {
        unsafe { self.header_mut().free = free }
    }

    fn set_next(&mut self, next: Option<Block>) {
        unsafe { self.header_mut().next = next.map(|b| b.header) }
    }

    /// An immutable view of the header.
    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This allows modifying the size or link of a block in safe code, which
    /// could corrupt the chain.
    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// Carve `size` payload bytes out of the front of this block and mark it
    /// used.
    ///
    /// If what is left over after `size` bytes and one more header is
    /// non-empty, it becomes a new free block linked directly after this one
    /// and is returned. Otherwise the block keeps its whole capacity and
    /// `None` is returned.
    ///
    /// Either way no bytes are created or lost:
    /// `old_size == self.size() + HEADER_SIZE + remainder.size()`.
    pub fn split(&mut self, size: usize) -> Option<Block> {
        let old_size = self.size();
        let remainder = if old_size > size + HEADER_SIZE {
            let remainder_size = old_size - size - HEADER_SIZE;
            let mut remainder = unsafe {
                let at = NonNull::new_unchecked(self.data_start().as_ptr().add(size));
                Block::from_raw(at, remainder_size, true)
            };
            remainder.set_next(self.next());
            self.set_next(Some(remainder));
            unsafe { self.header_mut().size = size };
            log::trace!(
                "Split {:?}:{} into {} + {} at {:?}",
                self.header,
                old_size,
                size,
                remainder_size,
                remainder.header,
            );
            Some(remainder)
        } else {
            None
        };

        self.set_free(false);
        remainder
    }

    /// The first 8-byte aligned address at or after the data start. The
    /// block's size shrinks by however many padding bytes that skips.
    ///
    /// Headers are aligned and a multiple of `ALIGNMENT` in size, so the
    /// padding is always zero for blocks built by this crate.
    pub fn aligned_payload(&mut self) -> NonNull<u8> {
        let start = self.data_start();
        let misalignment = start.as_ptr() as usize % ALIGNMENT;
        if misalignment == 0 {
            return start;
        }

        let padding = ALIGNMENT - misalignment;
        debug_assert!(false, "Misaligned block header at {:?}", self.header);
        unsafe {
            let header = self.header_mut();
            header.size = header.size.saturating_sub(padding);
            NonNull::new_unchecked(start.as_ptr().add(padding))
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:?}, {}, {})",
            self.header,
            self.size(),
            if self.is_free() { "free" } else { "used" }
        )
    }
}

/// One line of a pool dump.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: *const u8,
    /// Usable payload bytes.
    pub size: usize,
    pub free: bool,
}

impl BlockInfo {
    /// The pointer `alloc` hands out for this block.
    pub fn payload(&self) -> *const u8 {
        self.address.wrapping_add(HEADER_SIZE)
    }
}

impl From<Block> for BlockInfo {
    fn from(block: Block) -> BlockInfo {
        BlockInfo {
            address: block.address().as_ptr(),
            size: block.size(),
            free: block.is_free(),
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block: {:p}, size: {}, free: {}",
            self.address, self.size, self.free as u8
        )
    }
}

/// A `BlockList` is the chain of every block a pool has ever carved out,
/// free or used.
///
/// It maintains a few internal invariants:
///
/// - Each block links to the next, with the tail linking to nothing.
/// - Blocks are only ever added: by splitting (right after the split block),
///   or by growth (at the tail), or by pool initialization (at the head).
/// - No two blocks overlap.
///
/// The chain is in address order after splitting alone, but blocks from heap
/// growth come from independent reservations and may sit anywhere.
pub struct BlockList {
    head: Option<Block>,
    tail: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList::new()
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a count of all invalid states found in a BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of block pairs claiming the same memory.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of blocks whose payload does not start on an `ALIGNMENT`
    /// boundary.
    pub misaligned: usize,
    /// Number of headers without `BLOCK_MAGIC`.
    pub bad_magic: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.misaligned == 0 && self.bad_magic == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Total number of blocks in the chain.
    pub length: usize,
    pub free_blocks: usize,
    /// Payload bytes in free blocks.
    pub free_size: usize,
    pub used_blocks: usize,
    /// Payload bytes in used blocks.
    pub used_size: usize,
}

impl Stats {
    /// Bytes covered by the chain, headers included.
    pub fn footprint(&self) -> usize {
        self.free_size + self.used_size + self.length * HEADER_SIZE
    }
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList {
            head: None,
            tail: None,
        }
    }

    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    pub fn iter(&self) -> BlockIter {
        self.iter_from(self.head)
    }

    /// Iterate from `start` to the tail. `start` must be a member of this list.
    pub fn iter_from(&self, start: Option<Block>) -> BlockIter {
        BlockIter {
            next: start,
            list: PhantomData,
        }
    }

    /// Link `block` in as the new head.
    pub fn push_front(&mut self, mut block: Block) {
        block.set_next(self.head);
        if self.tail.is_none() {
            self.tail = Some(block);
        }
        self.head = Some(block);
    }

    /// Link `block` in after the current tail.
    pub fn push_back(&mut self, mut block: Block) {
        block.set_next(None);
        match self.tail {
            None => self.head = Some(block),
            Some(mut tail) => tail.set_next(Some(block)),
        }
        self.tail = Some(block);
    }

    /// Split `block` (a member of this list) down to `size` bytes, keeping
    /// the tail up to date if a remainder gets appended after it.
    pub fn split(&mut self, mut block: Block, size: usize) -> Option<Block> {
        let remainder = block.split(size)?;
        if self.tail == Some(block) {
            self.tail = Some(remainder);
        }
        Some(remainder)
    }

    /// Check the current size of the list, and whether it is valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        for (ix, block) in self.iter().enumerate() {
            // Growth does not keep address order, so every pair is checked.
            validity.overlaps += self
                .iter()
                .take(ix)
                .filter(|earlier| earlier.overlaps(&block))
                .count();
            if block.data_start().as_ptr() as usize % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }
            if !block.has_magic() {
                validity.bad_magic += 1;
            }

            stats.length += 1;
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_size += block.size();
            } else {
                stats.used_blocks += 1;
                stats.used_size += block.size();
            }
        }

        (validity, stats)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}
