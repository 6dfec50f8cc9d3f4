//! Interrupt Descriptor Table.

use core::mem::size_of;

use static_assertions::const_assert_eq;

use crate::arch::{self, DescriptorTablePointer};
use crate::{KernelCell, info};

const IDT_ENTRIES: usize = 256;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    base_low: u16,
    /// Code segment selector the handler runs with.
    selector: u16,
    always0: u8,
    flags: u8,
    base_high: u16,
}

const_assert_eq!(size_of::<IdtEntry>(), 8);

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            base_low: 0,
            selector: 0,
            always0: 0,
            flags: 0,
            base_high: 0,
        }
    }
}

static IDT: KernelCell<[IdtEntry; IDT_ENTRIES]> = KernelCell::new([IdtEntry::missing(); IDT_ENTRIES]);

/// Point a gate at a handler.
pub fn set_gate(num: u8, base: u32, selector: u16, flags: u8) {
    unsafe {
        let idt = &mut *IDT.get();
        idt[num as usize] = IdtEntry {
            base_low: (base & 0xFFFF) as u16,
            selector,
            always0: 0,
            flags,
            base_high: ((base >> 16) & 0xFFFF) as u16,
        };
    }
}

/// Load an initially empty IDT.
pub fn init() {
    let _guard = arch::InterruptGuard::new();
    unsafe {
        *IDT.get() = [IdtEntry::missing(); IDT_ENTRIES];
        let pointer = DescriptorTablePointer {
            limit: (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16,
            base: IDT.get() as usize as u32,
        };
        arch::load_idt(&pointer);
    }
    info!("idt loaded");
}
