//! Global Descriptor Table and Task State Segment.
//!
//! Six descriptors: null, kernel code/data, user code/data and the TSS.
//! The only piece of the TSS the kernel actively uses is `esp0`, which the
//! scheduler points at the chosen task's kernel stack before every return
//! to user space.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::arch::{self, DescriptorTablePointer};
use crate::{KernelCell, info};

/// Ring-0 flat code segment selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Ring-0 flat data segment selector.
pub const KERNEL_DATA: u16 = 0x10;
/// Ring-3 flat code segment selector (without RPL bits).
pub const USER_CODE: u16 = 0x18;
/// Ring-3 flat data segment selector (without RPL bits).
pub const USER_DATA: u16 = 0x20;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;
/// Requested privilege level bits for ring-3 selectors.
pub const RING3: u16 = 0x3;

const GDT_ENTRIES: usize = 6;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

const_assert_eq!(size_of::<GdtEntry>(), 8);

impl GdtEntry {
    const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (((limit >> 16) & 0x0F) as u8) | (granularity & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    const fn null() -> Self {
        GdtEntry::new(0, 0, 0, 0)
    }
}

/// Hardware task state segment. Only `ss0`/`esp0` matter: the CPU loads
/// them when an interrupt crosses from ring 3 into ring 0.
#[repr(C, packed)]
struct TaskStateSegment {
    prev_tss: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

const_assert_eq!(size_of::<TaskStateSegment>(), 104);

impl TaskStateSegment {
    // Zero eflags also clears the I/O privilege level, keeping port
    // instructions confined to ring 0.
    const fn zeroed() -> Self {
        TaskStateSegment {
            prev_tss: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: 0,
        }
    }
}

static GDT: KernelCell<[GdtEntry; GDT_ENTRIES]> = KernelCell::new([GdtEntry::null(); GDT_ENTRIES]);
static TSS: KernelCell<TaskStateSegment> = KernelCell::new(TaskStateSegment::zeroed());

/// Build and install the GDT and TSS.
pub fn init() {
    let _guard = arch::InterruptGuard::new();

    let tss_base = TSS.get() as usize as u32;
    let tss_limit = size_of::<TaskStateSegment>() as u32;

    unsafe {
        let gdt = &mut *GDT.get();
        gdt[0] = GdtEntry::null();
        gdt[1] = GdtEntry::new(0, 0xFFFF_FFFF, 0x9A, 0xCF); // kernel code (0x08)
        gdt[2] = GdtEntry::new(0, 0xFFFF_FFFF, 0x92, 0xCF); // kernel data (0x10)
        gdt[3] = GdtEntry::new(0, 0xFFFF_FFFF, 0xFA, 0xCF); // user code (0x18)
        gdt[4] = GdtEntry::new(0, 0xFFFF_FFFF, 0xF2, 0xCF); // user data (0x20)
        gdt[5] = GdtEntry::new(tss_base, tss_limit, 0xE9, 0x00); // TSS (0x28)

        let tss = &mut *TSS.get();
        tss.ss0 = KERNEL_DATA as u32;
        tss.esp0 = 0;
        // Segments loaded when the CPU enters ring 0 from ring 3; RPL 3 so
        // the transition is permitted from user mode.
        tss.cs = (KERNEL_CODE | RING3) as u32;
        let data = (KERNEL_DATA | RING3) as u32;
        tss.ss = data;
        tss.ds = data;
        tss.es = data;
        tss.fs = data;
        tss.gs = data;
        // An I/O map base equal to the TSS limit disables the permission
        // bitmap entirely.
        tss.iomap_base = tss_limit as u16;

        let pointer = DescriptorTablePointer {
            limit: (size_of::<GdtEntry>() * GDT_ENTRIES - 1) as u16,
            base: GDT.get() as usize as u32,
        };
        arch::load_gdt(&pointer, KERNEL_CODE, KERNEL_DATA);
        arch::load_task_register(TSS_SELECTOR);
    }

    info!("gdt and tss initialized");
}

/// Point TSS `esp0` at a task's kernel stack.
///
/// The CPU reads it on every ring 3 → ring 0 interrupt, so this must be
/// updated before returning into a different user task.
pub fn set_kernel_stack(stack_top: u32) {
    unsafe {
        (*TSS.get()).esp0 = stack_top;
    }
}

/// Current TSS `esp0` value.
pub fn kernel_stack() -> u32 {
    unsafe { (*TSS.get()).esp0 }
}

/// True for the four configured code/data selector values, in either ring.
pub fn selector_is_valid(selector: u32) -> bool {
    if selector > (USER_DATA | RING3) as u32 {
        return false;
    }
    // Mask off the RPL and table bits.
    let index = selector & 0xFC;
    index == KERNEL_CODE as u32
        || index == KERNEL_DATA as u32
        || index == USER_CODE as u32
        || index == USER_DATA as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_selectors() {
        assert!(selector_is_valid(KERNEL_CODE as u32));
        assert!(selector_is_valid(KERNEL_DATA as u32));
        assert!(selector_is_valid((USER_CODE | RING3) as u32));
        assert!(selector_is_valid((USER_DATA | RING3) as u32));
    }

    #[test]
    fn invalid_selectors() {
        assert!(!selector_is_valid(0));
        assert!(!selector_is_valid(0x04));
        assert!(!selector_is_valid((TSS_SELECTOR | RING3) as u32));
        assert!(!selector_is_valid(0x1234));
    }

    #[test]
    fn esp0_tracks_set_kernel_stack() {
        let _guard = crate::test_support::lock_kernel_state();
        set_kernel_stack(0x1234_5678);
        assert_eq!(kernel_stack(), 0x1234_5678);
    }
}
