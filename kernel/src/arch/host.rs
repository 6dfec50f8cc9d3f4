//! Host stand-in for the privileged-instruction layer.
//!
//! Used whenever the kernel is not built for the bare-metal i686 target,
//! which in practice means the unit-test host. Interrupt state is tracked
//! in an atomic so the `InterruptGuard` discipline stays observable; the
//! remaining operations record nothing the tests need and are no-ops.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::DescriptorTablePointer;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);
static CURRENT_CR3: AtomicU32 = AtomicU32::new(0);
static CURRENT_CR2: AtomicU32 = AtomicU32::new(0);

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::Relaxed)
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
}

pub fn halt() {
    core::hint::spin_loop();
}

pub fn read_fault_address() -> u32 {
    CURRENT_CR2.load(Ordering::Relaxed)
}

/// Test hook: plant a fault address for the page-fault diagnostics.
pub fn set_fault_address(addr: u32) {
    CURRENT_CR2.store(addr, Ordering::Relaxed);
}

pub unsafe fn load_page_directory(base: u32) {
    CURRENT_CR3.store(base, Ordering::Relaxed);
}

/// Test hook: the last base handed to `load_page_directory`.
pub fn loaded_page_directory() -> u32 {
    CURRENT_CR3.load(Ordering::Relaxed)
}

pub unsafe fn enable_paging() {}

pub fn invalidate_page(_vaddr: u32) {}

pub unsafe fn load_gdt(_ptr: &DescriptorTablePointer, _code: u16, _data: u16) {}

pub unsafe fn load_idt(_ptr: &DescriptorTablePointer) {}

pub unsafe fn load_task_register(_selector: u16) {}

pub fn outb(_port: u16, _value: u8) {}

/// Reads as "transmit holding register empty, no data ready" so the serial
/// driver never blocks and never fabricates input.
pub fn inb(_port: u16) -> u8 {
    0x20
}
