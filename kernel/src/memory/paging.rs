//! Page directories of 4 MiB super-pages.
//!
//! Every address space is a single 4 KiB-aligned array of 1024 entries, one
//! per super-page of the 32-bit virtual space. The kernel directory
//! identity-maps the kernel's super-page and serves as the template every
//! user directory is cloned from. Copies between address spaces stage
//! through transient windows mapped into the current directory.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;

use crate::arch::{self, InterruptGuard};
use crate::interrupts::HandlerOutcome;
use crate::interrupts::isr::Registers;
use crate::{KernelCell, println, tasks};

use super::{PAGE_DIR_ENTRIES, PAGE_SIZE, addr_to_page, page_address, page_to_addr};

bitflags! {
    /// Page directory entry bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Must be set on every entry: this kernel maps 4 MiB pages only.
        const PAGE_4M = 1 << 7;
        /// Never set; global pages survive CR3 reloads.
        const GLOBAL = 1 << 8;
    }
}

bitflags! {
    /// Page fault error code pushed by the CPU.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFaultCode: u32 {
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Physical frame bits of a 4 MiB entry.
pub const PAGE_MASK: u32 = 0xFFC0_0000;

/// One address space: 1024 super-page entries.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [u32; PAGE_DIR_ENTRIES],
}

impl PageDirectory {
    pub const fn empty() -> Self {
        PageDirectory {
            entries: [0; PAGE_DIR_ENTRIES],
        }
    }

    fn entry_index(vaddr: u32) -> usize {
        assert!(
            vaddr % PAGE_SIZE == 0,
            "virtual address {:#x} is not 4MB aligned",
            vaddr
        );
        addr_to_page(vaddr) as usize
    }

    /// Map an unmapped super-page.
    ///
    /// `vaddr` and `paddr` must be 4 MiB aligned, the entry must be empty
    /// and the global bit must not be requested. The entry always gains
    /// `PRESENT | WRITABLE | PAGE_4M` on top of `flags`.
    pub fn map(&mut self, vaddr: u32, paddr: u32, flags: PageFlags) {
        let _guard = InterruptGuard::new();

        // Bits 21:12 are reserved in a 4 MiB entry, so the physical address
        // must be 4 MiB aligned too.
        assert!(
            paddr % PAGE_SIZE == 0,
            "physical address {:#x} is not 4MB aligned",
            paddr
        );
        assert!(!flags.contains(PageFlags::GLOBAL), "DO NOT ENABLE THE GLOBAL BIT");

        let entry = &mut self.entries[Self::entry_index(vaddr)];
        assert!(
            *entry & PageFlags::PRESENT.bits() == 0,
            "entry for {:#x} is already mapped",
            vaddr
        );

        *entry = paddr
            | (PageFlags::PRESENT | PageFlags::PAGE_4M | PageFlags::WRITABLE | flags).bits();

        arch::invalidate_page(vaddr);
    }

    /// Clear a present mapping.
    pub fn unmap(&mut self, vaddr: u32) {
        let _guard = InterruptGuard::new();

        let entry = &mut self.entries[Self::entry_index(vaddr)];
        assert!(
            *entry & PageFlags::PRESENT.bits() != 0,
            "entry for {:#x} is not mapped",
            vaddr
        );
        *entry = 0;

        arch::invalidate_page(vaddr);
    }

    pub fn is_mapped(&self, vaddr: u32) -> bool {
        self.entries[Self::entry_index(vaddr)] & PageFlags::PRESENT.bits() != 0
    }

    /// Physical address backing a mapped virtual address.
    pub fn physical_of(&self, vaddr: u32) -> u32 {
        let entry = self.entries[Self::entry_index(vaddr)];
        assert!(
            entry & PageFlags::PRESENT.bits() != 0,
            "no physical page behind {:#x}",
            vaddr
        );
        entry & PAGE_MASK
    }

    pub fn num_free_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| *e & PageFlags::PRESENT.bits() == 0)
            .count()
    }

    /// Lowest unmapped super-page index at or above `lower_bound`.
    pub fn next_free_entry(&self, lower_bound: u32) -> Option<u32> {
        (lower_bound as usize..PAGE_DIR_ENTRIES)
            .find(|&i| self.entries[i] & PageFlags::PRESENT.bits() == 0)
            .map(|i| i as u32)
    }

    /// Copy of this directory with identical mappings. New user address
    /// spaces are cloned from the kernel directory so the kernel super-page
    /// and heap stay visible everywhere.
    pub fn duplicate(&self) -> Box<PageDirectory> {
        Box::new(PageDirectory { entries: self.entries })
    }

    /// Zero every entry. Only used on the kernel directory during boot.
    pub fn clear(&mut self) {
        self.entries = [0; PAGE_DIR_ENTRIES];
    }

    /// Address the hardware wants in CR3. Kernel memory is identity-mapped,
    /// so the directory's own address is its physical address.
    pub fn base_address(&self) -> u32 {
        self as *const PageDirectory as usize as u32
    }

    /// Copy `n` bytes from `src` interpreted in the current directory into
    /// `dst` interpreted in this directory.
    ///
    /// # Safety
    /// Both ranges must be mapped and the destination must tolerate raw
    /// byte writes.
    pub unsafe fn memcpy_from_current(&mut self, dst: u32, src: u32, n: usize) {
        unsafe {
            copy_between(current_directory(), self, src, dst, n).expect("cross-space copy failed");
        }
    }

    pub fn dump_mapped(&self) {
        println!("Mapped pages:");
        for (i, entry) in self.entries.iter().enumerate() {
            if *entry == 0 {
                continue;
            }
            let flags = PageFlags::from_bits_truncate(*entry);
            println!(
                "{}) {:#x} (vaddr {:#x} => paddr {:#x}, {}, {}, {}, {})",
                i,
                entry,
                page_to_addr(i as u32),
                entry & PAGE_MASK,
                if flags.contains(PageFlags::PRESENT) { "present" } else { "not present" },
                if flags.contains(PageFlags::WRITABLE) { "writable" } else { "read-only" },
                if flags.contains(PageFlags::USER) { "user" } else { "supervisor" },
                if flags.contains(PageFlags::GLOBAL) { "global" } else { "not global" },
            );
        }
    }
}

static KERNEL_DIR: KernelCell<PageDirectory> = KernelCell::new(PageDirectory::empty());
static CURRENT_DIR: AtomicPtr<PageDirectory> = AtomicPtr::new(ptr::null_mut());

/// The kernel's address space, shared as a template for user directories.
pub fn kernel_directory() -> *mut PageDirectory {
    KERNEL_DIR.get()
}

/// The directory currently installed in the paging hardware.
pub fn current_directory() -> *mut PageDirectory {
    let dir = CURRENT_DIR.load(Ordering::Relaxed);
    assert!(!dir.is_null(), "paging is not initialized");
    dir
}

/// Install `dir` as the current address space.
pub fn switch_to(dir: *mut PageDirectory) {
    let _guard = InterruptGuard::new();
    CURRENT_DIR.store(dir, Ordering::Relaxed);
    unsafe {
        arch::load_page_directory((*dir).base_address());
    }
}

pub fn is_current(dir: *const PageDirectory) -> bool {
    core::ptr::eq(dir, CURRENT_DIR.load(Ordering::Relaxed))
}

/// Identity-map the kernel super-page, install the kernel directory and
/// turn paging on.
pub fn init(kernel_start: u32) {
    assert!(
        kernel_start % PAGE_SIZE == 0,
        "expected the kernel to start on a page boundary"
    );

    let _guard = InterruptGuard::new();
    unsafe {
        let dir = &mut *kernel_directory();
        dir.clear();
        dir.map(kernel_start, kernel_start, PageFlags::empty());
    }
    switch_to(kernel_directory());
    unsafe {
        arch::enable_paging();
    }
}

/// Failure modes of the cross-space copy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CopyError {
    /// A touched page has no mapping in its directory.
    NotMapped,
    /// The current directory has no free entry left for a window.
    NoWindow,
}

/// Transient window into another address space.
///
/// Maps the frame backing `vaddr` in `dir` at a free slot of the current
/// directory; unmapped on drop.
struct TempMap {
    window: u32,
}

impl TempMap {
    fn new(dir: &PageDirectory, page_vaddr: u32) -> Result<TempMap, CopyError> {
        if !dir.is_mapped(page_vaddr) {
            return Err(CopyError::NotMapped);
        }
        let paddr = dir.physical_of(page_vaddr);

        let current = unsafe { &mut *current_directory() };
        let slot = current.next_free_entry(0).ok_or(CopyError::NoWindow)?;
        let window = page_to_addr(slot);
        current.map(window, paddr, PageFlags::empty());
        Ok(TempMap { window })
    }
}

impl Drop for TempMap {
    fn drop(&mut self) {
        unsafe {
            (*current_directory()).unmap(self.window);
        }
    }
}

/// Copy `n` bytes from `src` in `src_dir` to `dst` in `dst_dir`.
///
/// Either side that is not the current directory is reached through a
/// transient window; the copy proceeds in chunks that never cross a
/// super-page boundary, so at most two windows are live at a time. When
/// both sides are current this degenerates to a plain byte copy.
///
/// # Safety
/// The destination range must tolerate raw byte writes; window mappings
/// briefly mutate the current directory.
pub unsafe fn copy_between(
    src_dir: *mut PageDirectory,
    dst_dir: *mut PageDirectory,
    mut src: u32,
    mut dst: u32,
    mut n: usize,
) -> Result<(), CopyError> {
    let _guard = InterruptGuard::new();

    while n > 0 {
        let src_off = src - page_address(src);
        let dst_off = dst - page_address(dst);
        let chunk = (n as u32)
            .min(PAGE_SIZE - src_off)
            .min(PAGE_SIZE - dst_off) as usize;

        let (src_ptr, _src_window);
        if is_current(src_dir) {
            if !unsafe { (*src_dir).is_mapped(page_address(src)) } {
                return Err(CopyError::NotMapped);
            }
            src_ptr = src as usize as *const u8;
            _src_window = None;
        } else {
            let window = TempMap::new(unsafe { &*src_dir }, page_address(src))?;
            src_ptr = (window.window + src_off) as usize as *const u8;
            _src_window = Some(window);
        }

        let (dst_ptr, _dst_window);
        if is_current(dst_dir) {
            if !unsafe { (*dst_dir).is_mapped(page_address(dst)) } {
                return Err(CopyError::NotMapped);
            }
            dst_ptr = dst as usize as *mut u8;
            _dst_window = None;
        } else {
            let window = TempMap::new(unsafe { &*dst_dir }, page_address(dst))?;
            dst_ptr = (window.window + dst_off) as usize as *mut u8;
            _dst_window = Some(window);
        }

        unsafe {
            ptr::copy_nonoverlapping(src_ptr, dst_ptr, chunk);
        }

        src = src.wrapping_add(chunk as u32);
        dst = dst.wrapping_add(chunk as u32);
        n -= chunk;
    }

    Ok(())
}

/// Page fault diagnostics and disposition.
///
/// Faults in a user task kill the task with exit value 1; faults in the
/// kernel are unrecoverable.
pub fn page_fault(regs: &Registers) -> HandlerOutcome {
    let faulting_addr = arch::read_fault_address();
    let code = PageFaultCode::from_bits_truncate(regs.err_code);

    println!(
        "Page fault!!! When trying to {} {:#x}",
        if code.contains(PageFaultCode::WRITE) { "write to" } else { "read from" },
        faulting_addr,
    );
    println!("- IP:{:#x}", regs.eip);
    println!(
        "- The page was {}",
        if code.contains(PageFaultCode::PROTECTION) { "present" } else { "not present" }
    );
    if code.contains(PageFaultCode::RESERVED) {
        println!("- Reserved bit was set");
    }
    if code.contains(PageFaultCode::INSTRUCTION_FETCH) {
        println!("- Caused by an instruction fetch");
    }
    println!(
        "- CPU was in {}",
        if code.contains(PageFaultCode::USER) { "user-mode" } else { "supervisor mode" }
    );

    regs.dump();
    unsafe { &*current_directory() }.dump_mapped();
    crate::stacktrace::print_stack_trace();

    if tasks::scheduler::current_is_user() {
        HandlerOutcome::TerminateCurrent(1)
    } else {
        HandlerOutcome::Panic("page fault in kernel")
    }
}
