//! The segregated-fits strategy.
//!
//! Free blocks are threaded into one of sixteen circular doubly-linked
//! rings partitioned by size class. The links are intrusive: a free
//! block's payload area starts with its `pred` and `succ` fields, stored
//! as plain offsets into the backing region. The ring heads are dummy
//! block records at the very start of the heap whose links point to
//! themselves while their class is empty.
//!
//! Heap layout, addresses increasing to the right:
//!
//! ```text
//! | 16 ring heads: 16 * 32 | pad:8 | prologue:32 | blocks ... | epilogue:4 |
//! 0                      512     520           552
//! ```
//!
//! Block layout (the pad word after the header keeps payloads 16-byte
//! aligned, and free blocks reuse the payload area for their links):
//!
//! ```text
//! allocated: | header:4 | pad:4 | payload ...            | footer:4 |
//! free:      | header:4 | pad:4 | pred | succ | unused   | footer:4 |
//! ```
//!
//! Insertion is LIFO: a freshly freed block is spliced in right behind
//! its ring head and is therefore the first candidate of the next search
//! in its class. Searches start at the smallest viable class and escalate
//! to larger classes until a block fits.

use super::arena::{Arena, Blocks};
use super::tag::{State, Tag};
use super::{adjusted_size, CheckError, FreeError, Heap, HeapStats, OutOfMemory};
use super::{ALIGNMENT, CHUNK, WORD};

use core::mem::{self, MaybeUninit};

/// Number of size classes.
const CLASSES: usize = 16;
/// Bytes of one ring-head record (a dummy minimum block).
const HEAD_BYTES: usize = 32;
/// End of the ring-head table.
const HEADS_END: usize = CLASSES * HEAD_BYTES;
/// Offset of the prologue block; the 8 pad bytes in front of it put every
/// payload on a 16-byte boundary.
const PROLOGUE: usize = HEADS_END + 2 * WORD;
/// Offset of the first real block (and of the bootstrap epilogue).
const FIRST_BLOCK: usize = PROLOGUE + MIN_BLOCK;
/// Bytes requested from the backing region by the bootstrap.
const BOOT_BYTES: usize = FIRST_BLOCK + WORD;
/// The payload follows the header and the pad word.
const PAYLOAD_SHIFT: usize = 2 * WORD;
/// Per-block metadata: header, pad word and footer.
const OVERHEAD: usize = 3 * WORD;
/// Smallest viable block: enough room for both links while free.
const MIN_BLOCK: usize = 32;
/// Offset of the `pred` link inside a free block.
const PRED: usize = 2 * WORD;
/// Offset of the `succ` link inside a free block.
const SUCC: usize = PRED + mem::size_of::<usize>();

/// Size class of a block size.
///
/// Class `i` covers sizes in `(2^(i+4), 2^(i+5)]` with the last class
/// open ended, so an exact power of two lands in the lower class.
fn class_of(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK);
    let mut bit = (usize::BITS - 1 - size.leading_zeros()) as usize;
    if size.is_power_of_two() {
        bit -= 1;
    }
    (bit - 4).min(CLASSES - 1)
}

/// Heap strategy using per-size-class free lists over boundary-tag
/// blocks.
pub struct SegregatedHeap<const N: usize> {
    arena: Arena<N>,
    ready: bool,
}

impl<const N: usize> SegregatedHeap<N> {
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

    /// Lay down the ring heads, prologue and epilogue, then map the first
    /// chunk.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.ready {
            return Ok(());
        }
        self.arena.extend(BOOT_BYTES).ok_or(OutOfMemory)?;
        for class in 0..CLASSES {
            let head = class * HEAD_BYTES;
            self.write_block(head, Tag::used(HEAD_BYTES));
            self.arena.store_link(head + PRED, head);
            self.arena.store_link(head + SUCC, head);
        }
        self.write_block(PROLOGUE, Tag::used(MIN_BLOCK));
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
    /// When the current block is already large enough the allocation
    /// stays put; a viable tail is split off and re-enters a ring through
    /// the coalescer. Otherwise the payload moves to a fresh allocation.
    pub fn reallocate(&mut self, payload: usize, size: usize) -> Option<usize> {
        if size == 0 {
            self.free(payload).ok();
            return None;
        }
        let block = self.block_of(payload)?;
        let total = self.tag_at(block).size();
        let needed = adjusted_size(size, OVERHEAD, MIN_BLOCK)?;
        if total >= needed {
            if total - needed >= MIN_BLOCK {
                self.write_block(block, Tag::used(needed));
                self.write_block(block + needed, Tag::free(total - needed));
                self.coalesce(block + needed);
            }
            return Some(payload);
        }
        let new = self.allocate(size)?;
        self.arena.copy(payload, new, (total - OVERHEAD).min(size));
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

    /// Verify sentinels, tag agreement, payload alignment, coalescing,
    /// heap coverage and the well-formedness of every class ring.
    pub fn check(&self) -> Result<(), CheckError> {
        if !self.ready {
            return Ok(());
        }
        let epilogue = self.arena.size() - WORD;
        let prologue = Tag::used(MIN_BLOCK).as_raw();
        if self.arena.load_word(PROLOGUE) != prologue
            || self.arena.load_word(PROLOGUE + MIN_BLOCK - WORD) != prologue
        {
            return Err(CheckError::BadSentinel { offset: PROLOGUE });
        }
        if self.arena.load_word(epilogue) != Tag::EPILOGUE.as_raw() {
            return Err(CheckError::BadSentinel { offset: epilogue });
        }

        let mut block = FIRST_BLOCK;
        let mut prev_free = false;
        let mut walked_free = 0;
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
            if free {
                walked_free += 1;
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

        let mut listed = 0;
        for class in 0..CLASSES {
            let head = class * HEAD_BYTES;
            if self.arena.load_word(head) != Tag::used(HEAD_BYTES).as_raw() {
                return Err(CheckError::BadSentinel { offset: head });
            }
            let head_pred = self.arena.load_link(head + PRED);
            if head_pred != head && !self.link_target_ok(head_pred, epilogue) {
                return Err(CheckError::BrokenRing { class });
            }
            if self.arena.load_link(head_pred + SUCC) != head {
                return Err(CheckError::BrokenRing { class });
            }

            let mut node = self.arena.load_link(head + SUCC);
            let mut hops = 0;
            while node != head {
                hops += 1;
                if hops > walked_free || !self.link_target_ok(node, epilogue) {
                    return Err(CheckError::BrokenRing { class });
                }
                let tag = self.tag_at(node);
                if tag.state() != State::Free {
                    return Err(CheckError::BrokenRing { class });
                }
                if class_of(tag.size()) != class {
                    return Err(CheckError::MisclassedBlock { block: node, class });
                }
                let pred = self.arena.load_link(node + PRED);
                if pred != head && !self.link_target_ok(pred, epilogue) {
                    return Err(CheckError::BrokenRing { class });
                }
                if self.arena.load_link(pred + SUCC) != node {
                    return Err(CheckError::BrokenRing { class });
                }
                node = self.arena.load_link(node + SUCC);
            }
            listed += hops;
        }
        if listed != walked_free {
            return Err(CheckError::FreeCountMismatch {
                walked: walked_free,
                listed,
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
        debug_assert!(tag.size() >= MIN_BLOCK);
        self.arena.store_word(block, tag.as_raw());
        self.arena.store_word(block + tag.size() - WORD, tag.as_raw());
    }

    /// Whether an offset can be a ring node behind a link: a block in the
    /// real-block range with room for its links, or a ring head.
    fn link_target_ok(&self, offset: usize, epilogue: usize) -> bool {
        (offset < HEADS_END && offset % HEAD_BYTES == 0)
            || (offset >= FIRST_BLOCK
                && offset + MIN_BLOCK <= epilogue
                && offset % ALIGNMENT == FIRST_BLOCK % ALIGNMENT)
    }

    /// Splice a free block at the front of its class ring.
    fn insert(&mut self, block: usize) {
        let head = class_of(self.tag_at(block).size()) * HEAD_BYTES;
        let next = self.arena.load_link(head + SUCC);
        self.arena.store_link(block + PRED, head);
        self.arena.store_link(block + SUCC, next);
        self.arena.store_link(head + SUCC, block);
        self.arena.store_link(next + PRED, block);
    }

    /// Unlink a block from whichever ring holds it.
    fn remove(&mut self, block: usize) {
        let pred = self.arena.load_link(block + PRED);
        let succ = self.arena.load_link(block + SUCC);
        self.arena.store_link(pred + SUCC, succ);
        self.arena.store_link(succ + PRED, pred);
    }

    /// Grow the heap by `n` bytes and return the free block covering the
    /// new memory, merged and listed by the coalescer.
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

    /// Fuse the free block at `block` with free address-order neighbors,
    /// unlisting them, and insert the result into its class ring.
    fn coalesce(&mut self, block: usize) -> usize {
        let mut start = block;
        let mut size = self.tag_at(block).size();

        let next = block + size;
        let next_tag = self.tag_at(next);
        if next_tag.state() == State::Free {
            self.remove(next);
            size += next_tag.size();
        }

        // The prologue guarantees this footer read stays inside the heap.
        let prev_tag = Tag::from_raw(self.arena.load_word(block - WORD));
        if prev_tag.state() == State::Free {
            start = block - prev_tag.size();
            self.remove(start);
            size += prev_tag.size();
        }

        self.write_block(start, Tag::free(size));
        self.insert(start);
        start
    }

    /// First fit within the smallest viable class, escalating to larger
    /// classes until a block fits.
    fn find_fit(&self, needed: usize) -> Option<usize> {
        for class in class_of(needed)..CLASSES {
            let head = class * HEAD_BYTES;
            let mut node = self.arena.load_link(head + SUCC);
            while node != head {
                if self.tag_at(node).size() >= needed {
                    return Some(node);
                }
                node = self.arena.load_link(node + SUCC);
            }
        }
        None
    }

    /// Unlist a free block and mark it allocated, splitting off the tail
    /// into its own class when the remainder can stand alone as a block.
    fn place(&mut self, block: usize, needed: usize) {
        let total = self.tag_at(block).size();
        self.remove(block);
        if total - needed >= MIN_BLOCK {
            self.write_block(block, Tag::used(needed));
            let rest = block + needed;
            self.write_block(rest, Tag::free(total - needed));
            self.insert(rest);
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

impl<const N: usize> Default for SegregatedHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Heap for SegregatedHeap<N> {
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
