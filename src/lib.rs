//! Boundary-tag heap allocation for embedded systems.
//!
//! This crate manages a single contiguous heap region the way a classic
//! `sbrk` heap does: the region only ever grows at its high end, in
//! chunks of 4 KiB, and is never handed back. Every allocation lives in a
//! *block* that carries a packed size/state word as both its header and
//! its footer. Those boundary tags make the address-order neighbors of a
//! block reachable in constant time, so neighboring free blocks are fused
//! immediately whenever an allocation is released and the heap never
//! contains two adjacent free blocks.
//!
//! Two strategies share this block discipline:
//! * [`ImplicitHeap`] keeps no extra bookkeeping at all. Free blocks are
//!   found by scanning the blocks in address order, which is simple and
//!   compact but linear in the number of blocks.
//! * [`SegregatedHeap`] threads every free block into one of sixteen
//!   circular doubly-linked rings partitioned by size class. Searches
//!   start at the smallest viable class and only visit free blocks, and
//!   list insertion is LIFO, so hot blocks are reused quickly.
//!
//! Both hand out payloads aligned to 16 bytes and support allocate, free,
//! reallocate and zeroed allocation. The heaps themselves work on plain
//! byte offsets and are completely safe to embed in other data
//! structures; [`Allocator`] wraps the segregated strategy behind a
//! `spin::Mutex` and implements [`core::alloc::GlobalAlloc`] on top.
//!
//! # Usage
//! Copy and paste the following into your binary crate and adjust the
//! heap capacity (here 64 KiB) to your needs:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: tagalloc::Allocator<{ 64 * 1024 }> = tagalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards every collection of the [`alloc`-crate][alloc] simply
//! works. The capacity is the upper bound of the backing region; the heap
//! starts small and grows towards it chunk by chunk, so unused capacity
//! costs nothing but (zero-initialized) static memory.
//!
//! # Block format
//! Addresses increase to the right; tags are 32-bit words holding the
//! block size and an allocated bit:
//! ```text
//! allocated: | header:4 | pad:4 | payload ...          | footer:4 |
//! free:      | header:4 | pad:4 | pred | succ | unused | footer:4 |
//! ```
//! (The implicit strategy has no pad word and no links; its payload
//! starts directly after the header.) An allocated prologue block in
//! front of the first real block and a zero-size allocated epilogue word
//! behind the last one remove all edge cases from coalescing: every real
//! block has two readable neighbors at any time.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod heap;

pub use heap::{
    Blocks, CheckError, FreeError, Heap, HeapStats, ImplicitHeap, OutOfMemory, SegregatedHeap,
    ALIGNMENT,
};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// The global-allocator front end over a [`SegregatedHeap`].
///
/// The const parameter `N` is the capacity of the backing region in
/// bytes. The heap maps its sentinels and its first 4 KiB chunk lazily on
/// the first allocation and then grows on demand until `N` is exhausted;
/// further allocations fail with a null pointer, they never abort.
///
/// Its usage is simple: just copy and paste the following in the binary
/// crate you're developing and adjust the capacity to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: tagalloc::Allocator<{ 64 * 1024 }> = tagalloc::Allocator::new();
/// ```
pub struct Allocator<const N: usize> {
    /// The heap, protected by a `spin::Mutex` to make it usable with
    /// shared references (requirement of [`GlobalAlloc`]).
    heap: spin::Mutex<SegregatedHeap<N>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied capacity `N` is less
    /// than `8192` (the bootstrap records plus one chunk) or not
    /// divisible by 16.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N % 16 == 0, "heap capacity has to be divisible by 16");
        assert!(N >= 8192, "too small heap memory: minimum size is 8192");
        let heap = spin::Mutex::new(SegregatedHeap::new());
        Self { heap }
    }

    /// Verify the structural invariants of the heap.
    pub fn check(&self) -> Result<(), CheckError> {
        self.heap.lock().check()
    }

    /// Aggregate usage numbers of the heap.
    pub fn stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }
}

// SAFETY: the implementation adheres to the `GlobalAlloc` contract: it
// hands out properly sized and aligned memory, never unwinds and reports
// failure with null pointers. Requests it cannot serve (alignments above
// 16) are failures, not errors.
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // every payload is 16-byte aligned by construction; larger
        // alignments are not supported and fail cleanly
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let mut heap = self.heap.lock();
        match heap.allocate(layout.size()) {
            Some(payload) => heap.payload_ptr(payload),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut heap = self.heap.lock();
        let payload = heap.payload_offset(ptr);
        // the heap might detect errors (double free, foreign pointer),
        // but those cannot lead to panics here (by contract of
        // `GlobalAlloc`), so they are ignored
        let _maybe_error = heap.free(payload).ok();
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let mut heap = self.heap.lock();
        match heap.callocate(layout.size(), 1) {
            Some(payload) => heap.payload_ptr(payload),
            None => ptr::null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let mut heap = self.heap.lock();
        let payload = heap.payload_offset(ptr);
        match heap.reallocate(payload, new_size) {
            Some(moved) => heap.payload_ptr(moved),
            None => ptr::null_mut(),
        }
    }
}
