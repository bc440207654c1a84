//! The implicit free-list strategy.
//!
//! There is no dedicated free-list structure: every block (allocated or
//! free) is visited by stepping over block sizes from the start of the
//! heap, and free blocks are recognized by their tag alone. Finding a fit
//! is therefore linear in the total number of blocks, while free,
//! coalesce and split stay constant time thanks to the boundary tags.
//!
//! Heap layout, addresses increasing to the right:
//!
//! ```text
//! | pad:4 | prologue hdr:4 | prologue ftr:4 | blocks ... | epilogue:4 |
//! 0       4                8               12
//! ```
//!
//! The 4 bytes of padding in front of the prologue put every payload
//! (which starts 4 bytes into its block) on a 16-byte boundary. The
//! prologue is a minimum allocated block, so the first real block always
//! has an allocated address-order predecessor; the epilogue is the only
//! word with size zero and terminates every walk.

use super::arena::{Arena, Blocks};
use super::tag::{State, Tag};
use super::{adjusted_size, CheckError, FreeError, Heap, HeapStats, OutOfMemory};
use super::{ALIGNMENT, CHUNK, WORD};

use core::mem::MaybeUninit;

/// Bytes in front of the prologue keeping payloads 16-byte aligned.
const PAD: usize = WORD;
/// Offset of the prologue block.
const PROLOGUE: usize = PAD;
/// Size of the prologue block: header and footer, no payload.
const PROLOGUE_SIZE: usize = 2 * WORD;
/// Offset of the first real block (and of the bootstrap epilogue).
const FIRST_BLOCK: usize = PROLOGUE + PROLOGUE_SIZE;
/// Bytes requested from the backing region by the bootstrap.
const BOOT_BYTES: usize = FIRST_BLOCK + WORD;
/// The payload follows the header directly.
const PAYLOAD_SHIFT: usize = WORD;
/// Per-block metadata: header and footer.
const OVERHEAD: usize = 2 * WORD;
/// Smallest viable block: tags plus one alignment unit of payload.
const MIN_BLOCK: usize = 16;

/// Heap strategy using an implicit free list over boundary-tag blocks.
pub struct ImplicitHeap<const N: usize> {
    arena: Arena<N>,
    ready: bool,
}

impl<const N: usize> ImplicitHeap<N> {
    /// Create an uninitialized heap over a fresh backing region.
    ///
    /// # Panics
    /// Panics if `N` is not a multiple of 16.
    #[must_use]
    pub const fn new() -> Self {
        assert!(N % ALIGNMENT == 0, "heap size has to be divisible by 16");
        Self {
            arena: Arena::new(),
            ready: false,
        }
    }

    /// Lay down pad, prologue and epilogue, then map the first chunk.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.ready {
            return Ok(());
        }
        self.arena.extend(BOOT_BYTES).ok_or(OutOfMemory)?;
        self.write_block(PROLOGUE, Tag::used(PROLOGUE_SIZE));
        self.arena.store_word(FIRST_BLOCK, Tag::EPILOGUE.as_raw());
        self.ready = true;
        self.extend_heap(CHUNK).ok_or(OutOfMemory)?;
        Ok(())
    }

    /// Allocate `size` bytes and return the payload offset.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        if !self.ready {
            self.init().ok()?;
        }
        let needed = adjusted_size(size, OVERHEAD, MIN_BLOCK)?;
        let block = match self.find_fit(needed) {
            Some(block) => block,
            None => self.extend_heap(needed.max(CHUNK))?,
        };
        self.place(block, needed);
        Some(block + PAYLOAD_SHIFT)
    }

    /// Release the allocation at the given payload offset.
    pub fn free(&mut self, payload: usize) -> Result<(), FreeError> {
        let block = self
            .block_of(payload)
            .ok_or(FreeError::AllocationNotFound)?;
        let tag = self.tag_at(block);
        if tag.state() == State::Free {
            return Err(FreeError::DoubleFreeDetected);
        }
        self.write_block(block, Tag::free(tag.size()));
        self.coalesce(block);
        Ok(())
    }

    /// Resize the allocation at `payload` to `size` bytes.
    ///
    /// This strategy always moves: a new block is allocated, the payload
    /// prefix copied over and the old block freed. On failure the old
    /// allocation is left untouched.
    pub fn reallocate(&mut self, payload: usize, size: usize) -> Option<usize> {
        if size == 0 {
            self.free(payload).ok();
            return None;
        }
        let block = self.block_of(payload)?;
        let old_payload = self.tag_at(block).size() - OVERHEAD;
        let new = self.allocate(size)?;
        self.arena.copy(payload, new, old_payload.min(size));
        self.free(payload).ok();
        Some(new)
    }

    /// Allocate `count * size` bytes of zeroed memory.
    pub fn callocate(&mut self, count: usize, size: usize) -> Option<usize> {
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;
        let len = self.tag_at(payload - PAYLOAD_SHIFT).size() - OVERHEAD;
        self.arena.fill_zero(payload, len);
        Some(payload)
    }

    /// The usable bytes of the allocation at `payload`.
    pub fn payload(&self, payload: usize) -> &[MaybeUninit<u8>] {
        let len = self.tag_at(payload - PAYLOAD_SHIFT).size() - OVERHEAD;
        self.arena.memory(payload, len)
    }

    /// The usable bytes of the allocation at `payload`, mutably.
    pub fn payload_mut(&mut self, payload: usize) -> &mut [MaybeUninit<u8>] {
        let len = self.tag_at(payload - PAYLOAD_SHIFT).size() - OVERHEAD;
        self.arena.memory_mut(payload, len)
    }

    /// Iterate all blocks between prologue and epilogue in address order.
    pub fn blocks(&self) -> Blocks<'_, N> {
        self.arena.blocks(FIRST_BLOCK)
    }

    /// Aggregate usage numbers, computed from a full block walk.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.arena.size(),
            ..HeapStats::default()
        };
        for (_, tag) in self.blocks() {
            match tag.state() {
                State::Used => stats.used_bytes += tag.size(),
                State::Free => {
                    stats.free_bytes += tag.size();
                    stats.free_blocks += 1;
                }
            }
        }
        stats
    }

    /// Verify sentinels, tag agreement, payload alignment, coalescing and
    /// heap coverage.
    pub fn check(&self) -> Result<(), CheckError> {
        if !self.ready {
            return Ok(());
        }
        let epilogue = self.arena.size() - WORD;
        let prologue = Tag::used(PROLOGUE_SIZE).as_raw();
        if self.arena.load_word(PROLOGUE) != prologue
            || self.arena.load_word(PROLOGUE + WORD) != prologue
        {
            return Err(CheckError::BadSentinel { offset: PROLOGUE });
        }
        if self.arena.load_word(epilogue) != Tag::EPILOGUE.as_raw() {
            return Err(CheckError::BadSentinel { offset: epilogue });
        }

        let mut block = FIRST_BLOCK;
        let mut prev_free = false;
        loop {
            let tag = self.tag_at(block);
            if tag.size() == 0 {
                break;
            }
            if tag.size() % 8 != 0 || block + tag.size() > epilogue {
                return Err(CheckError::BadBlockSize { block });
            }
            if self.arena.load_word(block + tag.size() - WORD) != tag.as_raw() {
                return Err(CheckError::TagMismatch { block });
            }
            if (block + PAYLOAD_SHIFT) % ALIGNMENT != 0 {
                return Err(CheckError::MisalignedPayload { block });
            }
            let free = tag.state() == State::Free;
            if free && prev_free {
                return Err(CheckError::AdjacentFree { block });
            }
            prev_free = free;
            block += tag.size();
        }
        if block != epilogue {
            return Err(CheckError::CoverageMismatch {
                walked: block,
                expected: epilogue,
            });
        }
        Ok(())
    }

    /// Raw pointer to the payload at `payload`, for the global front end.
    pub fn payload_ptr(&mut self, payload: usize) -> *mut u8 {
        assert!(payload <= self.arena.size());
        // SAFETY: in bounds of the arena allocation per the assert.
        unsafe { self.arena.base_ptr().add(payload) }
    }

    /// Translate a raw payload pointer back into its heap offset.
    pub fn payload_offset(&self, ptr: *const u8) -> usize {
        (ptr as usize).wrapping_sub(self.arena.base_addr())
    }

    fn tag_at(&self, block: usize) -> Tag {
        Tag::from_raw(self.arena.load_word(block))
    }

    /// Write header and footer of a block from one tag.
    fn write_block(&mut self, block: usize, tag: Tag) {
        debug_assert!(tag.size() >= MIN_BLOCK || block == PROLOGUE);
        self.arena.store_word(block, tag.as_raw());
        self.arena.store_word(block + tag.size() - WORD, tag.as_raw());
    }

    /// Grow the heap by `n` bytes and return the free block covering the
    /// new memory, merged with a free predecessor if there is one.
    fn extend_heap(&mut self, n: usize) -> Option<usize> {
        debug_assert!(n % ALIGNMENT == 0);
        let old_top = self.arena.extend(n)?;
        // The old epilogue word becomes the header of the new block and a
        // fresh epilogue terminates the grown heap. The old epilogue was
        // allocated, so the new block never merges towards the top.
        let block = old_top - WORD;
        self.write_block(block, Tag::free(n));
        self.arena.store_word(block + n, Tag::EPILOGUE.as_raw());
        Some(self.coalesce(block))
    }

    /// Fuse the free block at `block` with free address-order neighbors.
    fn coalesce(&mut self, block: usize) -> usize {
        let mut start = block;
        let mut size = self.tag_at(block).size();

        let next_tag = self.tag_at(block + size);
        if next_tag.state() == State::Free {
            size += next_tag.size();
        }

        // The prologue guarantees this footer read stays inside the heap.
        let prev_tag = Tag::from_raw(self.arena.load_word(block - WORD));
        if prev_tag.state() == State::Free {
            start = block - prev_tag.size();
            size += prev_tag.size();
        }

        self.write_block(start, Tag::free(size));
        start
    }

    /// First-fit scan over all blocks in address order.
    fn find_fit(&self, needed: usize) -> Option<usize> {
        self.blocks()
            .find(|(_, tag)| tag.state() == State::Free && tag.size() >= needed)
            .map(|(block, _)| block)
    }

    /// Mark a free block allocated, splitting off the tail when the
    /// remainder can stand alone as a block.
    fn place(&mut self, block: usize, needed: usize) {
        let total = self.tag_at(block).size();
        if total - needed >= MIN_BLOCK {
            self.write_block(block, Tag::used(needed));
            self.write_block(block + needed, Tag::free(total - needed));
        } else {
            self.write_block(block, Tag::used(total));
        }
    }

    /// Recover and validate the block start behind a payload offset.
    fn block_of(&self, payload: usize) -> Option<usize> {
        let block = payload.checked_sub(PAYLOAD_SHIFT)?;
        if !self.ready
            || block < FIRST_BLOCK
            || block % ALIGNMENT != FIRST_BLOCK % ALIGNMENT
            || block + WORD > self.arena.size()
        {
            return None;
        }
        let size = self.tag_at(block).size();
        if size < MIN_BLOCK || size % ALIGNMENT != 0 || block + size > self.arena.size() {
            return None;
        }
        let footer = self.arena.load_word(block + size - WORD);
        (footer == self.arena.load_word(block)).then_some(block)
    }
}

impl<const N: usize> Default for ImplicitHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Heap for ImplicitHeap<N> {
    fn init(&mut self) -> Result<(), OutOfMemory> {
        Self::init(self)
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        Self::allocate(self, size)
    }

    fn free(&mut self, payload: usize) -> Result<(), FreeError> {
        Self::free(self, payload)
    }

    fn reallocate(&mut self, payload: usize, size: usize) -> Option<usize> {
        Self::reallocate(self, payload, size)
    }

    fn callocate(&mut self, count: usize, size: usize) -> Option<usize> {
        Self::callocate(self, count, size)
    }

    fn payload(&self, payload: usize) -> &[MaybeUninit<u8>] {
        Self::payload(self, payload)
    }

    fn payload_mut(&mut self, payload: usize) -> &mut [MaybeUninit<u8>] {
        Self::payload_mut(self, payload)
    }

    fn check(&self) -> Result<(), CheckError> {
        Self::check(self)
    }

    fn stats(&self) -> HeapStats {
        Self::stats(self)
    }
}
