//! Kernel heap.
//!
//! A linked-list heap over 4 MiB frames identity-mapped right after the
//! kernel image in the kernel directory. Identity mapping keeps heap
//! objects (page directories above all) at vaddr == paddr, and since every
//! user directory is cloned from the kernel directory the heap is visible
//! in all address spaces.
//!
//! The whole region is taken at init and never grows: kernel stacks and
//! the task arena live here, and a frame mapped after user directories
//! were cloned would be invisible to them.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::arch::InterruptGuard;
use crate::{info, warn};

use super::frames::FRAME_ALLOCATOR;
use super::paging::{self, PageFlags};
use super::{PAGE_SIZE, page_to_addr};

/// Frames backing the heap, taken at init while physical memory lasts.
const HEAP_FRAMES: usize = 2;

pub struct KernelHeap {
    inner: Mutex<Heap>,
}

#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: KernelHeap = KernelHeap {
    inner: Mutex::new(Heap::empty()),
};

/// Map one free frame at its own physical address in the kernel directory
/// and hand its range back.
fn map_identity_frame() -> Option<(u32, u32)> {
    let mut allocator = FRAME_ALLOCATOR.lock();
    let frame = allocator.next_free()?;
    allocator.mark_used(frame);
    drop(allocator);

    let addr = page_to_addr(frame);
    unsafe {
        (*paging::kernel_directory()).map(addr, addr, PageFlags::empty());
    }
    Some((addr, addr + PAGE_SIZE))
}

/// Back the heap with its frames. Must run after the frame allocator and
/// paging are initialized, before the first allocation.
pub fn init() {
    let _guard = InterruptGuard::new();

    let (start, mut end) = map_identity_frame().expect("no physical frame left for the kernel heap");
    for _ in 1..HEAP_FRAMES {
        match map_identity_frame() {
            Some((next_start, next_end)) if next_start == end => end = next_end,
            Some((next_start, _)) => {
                // Non-contiguous; give the frame back and settle for less.
                unsafe {
                    (*paging::kernel_directory()).unmap(next_start);
                }
                FRAME_ALLOCATOR.lock().mark_free(super::addr_to_page(next_start));
                warn!("kernel heap stops at {:#x}: next free frame is not contiguous", end);
                break;
            }
            None => {
                warn!("kernel heap stops at {:#x}: out of physical frames", end);
                break;
            }
        }
    }

    unsafe {
        ALLOCATOR.inner.lock().init(start as usize as *mut u8, (end - start) as usize);
    }
    info!("kernel heap initialized: {:#x} - {:#x}", start, end);
}

/// Free bytes left on the heap.
pub fn avail_memory() -> usize {
    ALLOCATOR.inner.lock().free()
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _guard = InterruptGuard::new();
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .map(|block| block.as_ptr())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _guard = InterruptGuard::new();
        unsafe {
            self.inner
                .lock()
                .deallocate(ptr::NonNull::new(ptr).expect("freeing a null pointer"), layout);
        }
    }
}
