//! Boot-time sanity tests.
//!
//! Run once during setup, after memory management and the scheduler are up
//! and before user space starts. These poke the real hardware-backed
//! structures, so they only exist on the bare-metal build; a failure is a
//! kernel bug and panics.

use alloc::vec::Vec;

use crate::memory::heap;
use crate::memory::frames::FRAME_ALLOCATOR;
use crate::memory::paging::{self, PageFlags};
use crate::memory::{frames, page_to_addr};
use crate::println;

pub fn run() {
    println!("Running kernel self-tests");

    frame_accounting();
    virtual_aliasing();
    heap_roundtrip();

    println!("All kernel self-tests passed!");
}

fn frame_accounting() {
    let allocator = FRAME_ALLOCATOR.lock();
    assert_eq!(allocator.num_used() + allocator.num_free(), allocator.num_frames());
    let frame = allocator.next_free().expect("no free frame for the self-test");
    assert!(!allocator.is_used(frame));
}

/// Two virtual pages mapped to one frame must alias: writes through the
/// first mapping are visible through the second.
fn virtual_aliasing() {
    let free_frames = frames::num_free();

    let frame = FRAME_ALLOCATOR.lock().next_free().expect("no free frame");
    FRAME_ALLOCATOR.lock().mark_used(frame);
    let paddr = page_to_addr(frame);

    let dir = unsafe { &mut *paging::current_directory() };
    let free_entries = dir.num_free_entries();

    let vaddr1 = page_to_addr(dir.next_free_entry(0).expect("no free virtual page"));
    dir.map(vaddr1, paddr, PageFlags::empty());
    let vaddr2 = page_to_addr(dir.next_free_entry(0).expect("no free virtual page"));
    assert_ne!(vaddr1, vaddr2);
    dir.map(vaddr2, paddr, PageFlags::empty());

    let window1 = vaddr1 as usize as *mut u32;
    let window2 = vaddr2 as usize as *const u32;
    for i in 0..8 {
        unsafe {
            window1.add(i).write_volatile(i as u32);
            assert_eq!(window2.add(i).read_volatile(), i as u32);
        }
    }

    dir.unmap(vaddr1);
    dir.unmap(vaddr2);
    FRAME_ALLOCATOR.lock().mark_free(frame);

    assert_eq!(dir.num_free_entries(), free_entries);
    assert_eq!(frames::num_free(), free_frames);
}

/// Allocations must come back to the heap in full.
fn heap_roundtrip() {
    let avail = heap::avail_memory();
    {
        let values: Vec<u32> = (0..1024).collect();
        assert_eq!(values.iter().sum::<u32>(), 1023 * 1024 / 2);
    }
    assert_eq!(heap::avail_memory(), avail);
}
