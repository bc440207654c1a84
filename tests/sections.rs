//! Regression test for the linker placement of static heaps.
//!
//! A heap of this crate initializes nothing up front: the backing region
//! stays unmapped until the bootstrap runs on the first allocation, and
//! the only eagerly-set fields (the arena watermark, the ready flag and
//! the front-end lock) are all zero. A static heap must therefore land in
//! `.bss`. If it ends up in `.data` instead, the image carries the whole
//! heap capacity as initialization bytes in flash on embedded targets,
//! defeating the point of an uninitialized backing region.
//!
//! Both strategies and the `GlobalAlloc` front end are checked, since all
//! three are meant to be usable as statics.

use std::ptr;

use tagalloc::{Allocator, ImplicitHeap, SegregatedHeap};

static GLOBAL: Allocator<8192> = Allocator::new();
static IMPLICIT: ImplicitHeap<8192> = ImplicitHeap::new();
static SEGREGATED: SegregatedHeap<8192> = SegregatedHeap::new();

#[cfg(all(target_arch = "x86_64", target_os = "linux"))] // this is only tested on Linux
#[test]
fn heap_statics_live_in_bss() {
    // touch the statics so they survive into the binary, and confirm that
    // no backing bytes are mapped before the first allocation
    assert_eq!(GLOBAL.stats().heap_size, 0);
    assert_eq!(IMPLICIT.stats().heap_size, 0);
    assert_eq!(SEGREGATED.stats().heap_size, 0);

    let (data_end, bss_start) = section_bounds();
    assert_eq!(data_end, bss_start, "test assumes bss directly after data");

    for (name, addr) in [
        ("Allocator", ptr::addr_of!(GLOBAL) as usize),
        ("ImplicitHeap", ptr::addr_of!(IMPLICIT) as usize),
        ("SegregatedHeap", ptr::addr_of!(SEGREGATED) as usize),
    ] {
        assert!(addr >= bss_start, "{name} static is placed in .data");
    }
}

/// End of `.data` and start of `.bss`, reconstructed at runtime from the
/// symbols of the default linker script.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn section_bounds() -> (usize, usize) {
    extern "C" {
        static _edata: usize;
        static __bss_start: usize;
    }

    // SAFETY: the linker defines both symbols; only their addresses are
    // taken, their (meaningless) values are never read.
    let data_end = unsafe { ptr::addr_of!(_edata) } as usize;
    let bss_start = unsafe { ptr::addr_of!(__bss_start) } as usize;
    (data_end, bss_start)
}
