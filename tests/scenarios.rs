//! Scenario suite driving both heap strategies through the same
//! allocation patterns, with the structural invariants verified after
//! every public operation.

use core::mem::MaybeUninit;

use tagalloc::{FreeError, Heap, ImplicitHeap, SegregatedHeap};

const HEAP: usize = 64 * 1024;

/// Write a recognizable byte pattern into the first `len` payload bytes.
fn fill(heap: &mut impl Heap, payload: usize, len: usize, seed: u8) {
    for (i, byte) in heap.payload_mut(payload)[..len].iter_mut().enumerate() {
        *byte = MaybeUninit::new(seed.wrapping_add(i as u8));
    }
}

/// Assert the pattern written by [`fill`] is still intact.
fn assert_contents(heap: &impl Heap, payload: usize, len: usize, seed: u8) {
    for (i, byte) in heap.payload(payload)[..len].iter().enumerate() {
        // SAFETY: the byte was initialized by `fill`
        let byte = *unsafe { byte.assume_init_ref() };
        assert_eq!(byte, seed.wrapping_add(i as u8));
    }
}

/// Sizes around the alignment, the block granularity and the chunk size.
fn boundary_sizes(heap: &mut impl Heap) {
    for size in [1, 7, 8, 9, 15, 16, 17, 4095, 4096, 4097] {
        let payload = heap.allocate(size).unwrap();
        assert_eq!(payload % 16, 0, "payload for size {size} is misaligned");
        assert!(heap.payload(payload).len() >= size);
        heap.check().unwrap();
        heap.free(payload).unwrap();
        heap.check().unwrap();
    }
}

/// Freeing in hole-guard-hole patterns exercises every coalesce case.
fn coalesce_matrix(heap: &mut impl Heap) {
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();
    let d = heap.allocate(100).unwrap();
    let blocks_before = heap.stats().free_blocks;

    // both neighbors allocated: nothing merges
    heap.free(b).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, blocks_before + 1);

    // next neighbor free: `a` fuses forward into the hole of `b`
    heap.free(a).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, blocks_before + 1);

    // previous neighbor free: `c` fuses backward into that hole
    heap.free(c).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, blocks_before + 1);

    // both neighbors free: `d` bridges the hole and the chunk tail
    heap.free(d).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, 1);
}

/// An allocate/free pair returns the heap to its previous shape.
fn allocate_free_restores_the_heap(heap: &mut impl Heap) {
    // initialize lazily, then snapshot
    let warmup = heap.allocate(8).unwrap();
    heap.free(warmup).unwrap();
    let snapshot = heap.stats();

    let payload = heap.allocate(500).unwrap();
    heap.free(payload).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats(), snapshot);
}

fn reallocation_preserves_the_prefix(heap: &mut impl Heap) {
    let payload = heap.allocate(100).unwrap();
    fill(heap, payload, 100, 0xa5);

    let grown = heap.reallocate(payload, 2000).unwrap();
    assert_contents(heap, grown, 100, 0xa5);

    let shrunk = heap.reallocate(grown, 40).unwrap();
    assert_contents(heap, shrunk, 40, 0xa5);
    heap.check().unwrap();

    assert_eq!(heap.reallocate(shrunk, 0), None);
    heap.check().unwrap();
}

fn callocation_is_zeroed(heap: &mut impl Heap) {
    let payload = heap.callocate(4, 256).unwrap();
    for byte in heap.payload(payload) {
        // SAFETY: `callocate` initialized the whole payload
        assert_eq!(*unsafe { byte.assume_init_ref() }, 0);
    }
    heap.free(payload).unwrap();

    assert_eq!(heap.callocate(usize::MAX, 2), None);
    assert_eq!(heap.callocate(1 << 40, 1 << 40), None);
    assert_eq!(heap.callocate(0, 16), None);
    heap.check().unwrap();
}

fn degenerate_requests(heap: &mut impl Heap) {
    assert_eq!(heap.allocate(0), None);
    assert_eq!(heap.allocate(usize::MAX), None);
    assert_eq!(heap.free(3), Err(FreeError::AllocationNotFound));
    heap.check().unwrap();
}

/// Random allocate/free traffic with content verification.
fn stress(heap: &mut impl Heap) {
    fastrand::seed(0x5eed);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();
    for round in 0..2000 {
        if live.is_empty() || fastrand::bool() {
            let size = fastrand::usize(1..512);
            let seed = fastrand::u8(..);
            if let Some(payload) = heap.allocate(size) {
                fill(heap, payload, size, seed);
                live.push((payload, size, seed));
            }
        } else {
            let (payload, size, seed) = live.swap_remove(fastrand::usize(..live.len()));
            assert_contents(heap, payload, size, seed);
            heap.free(payload).unwrap();
        }
        if round % 64 == 0 {
            heap.check().unwrap();
        }
    }
    for (payload, size, seed) in live.drain(..) {
        assert_contents(heap, payload, size, seed);
        heap.free(payload).unwrap();
    }
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, 1, "full coalescing after teardown");
}

mod implicit {
    use super::*;

    #[test]
    fn boundary_sizes() {
        super::boundary_sizes(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn coalesce_matrix() {
        super::coalesce_matrix(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn allocate_free_restores_the_heap() {
        super::allocate_free_restores_the_heap(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn reallocation_preserves_the_prefix() {
        super::reallocation_preserves_the_prefix(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn callocation_is_zeroed() {
        super::callocation_is_zeroed(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn degenerate_requests() {
        super::degenerate_requests(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn stress() {
        super::stress(&mut ImplicitHeap::<HEAP>::new());
    }

    #[test]
    fn exhaustion_is_graceful() {
        // room for the bootstrap plus exactly one chunk
        let mut heap = ImplicitHeap::<4112>::new();
        let a = heap.allocate(1350).unwrap();
        let b = heap.allocate(1350).unwrap();
        let c = heap.allocate(1350).unwrap();
        assert_eq!(heap.allocate(1350), None);

        // earlier allocations stay intact and freeable
        fill(&mut heap, b, 1350, 42);
        assert_contents(&heap, b, 1350, 42);
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        heap.free(b).unwrap();
        heap.check().unwrap();
        assert_eq!(heap.stats().free_blocks, 1);
    }
}

mod segregated {
    use super::*;

    #[test]
    fn boundary_sizes() {
        super::boundary_sizes(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn coalesce_matrix() {
        super::coalesce_matrix(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn allocate_free_restores_the_heap() {
        super::allocate_free_restores_the_heap(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn reallocation_preserves_the_prefix() {
        super::reallocation_preserves_the_prefix(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn reallocation_shrinks_in_place() {
        let mut heap = SegregatedHeap::<HEAP>::new();
        let payload = heap.allocate(1000).unwrap();
        fill(&mut heap, payload, 32, 7);

        let shrunk = heap.reallocate(payload, 32).unwrap();
        assert_eq!(shrunk, payload);
        assert_contents(&heap, shrunk, 32, 7);
        heap.check().unwrap();
    }

    #[test]
    fn callocation_is_zeroed() {
        super::callocation_is_zeroed(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn degenerate_requests() {
        super::degenerate_requests(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn stress() {
        super::stress(&mut SegregatedHeap::<HEAP>::new());
    }

    #[test]
    fn exhaustion_is_graceful() {
        // room for the ring heads, the sentinels and exactly one chunk
        let mut heap = SegregatedHeap::<4656>::new();
        let a = heap.allocate(1500).unwrap();
        let b = heap.allocate(1500).unwrap();
        assert_eq!(heap.allocate(1500), None);

        fill(&mut heap, a, 1500, 3);
        assert_contents(&heap, a, 1500, 3);
        heap.free(b).unwrap();
        heap.free(a).unwrap();
        heap.check().unwrap();
        assert_eq!(heap.stats().free_blocks, 1);
    }
}
