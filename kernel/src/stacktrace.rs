//! Stack traces from the frame-pointer chain.
//!
//! Best effort: follows saved ebp links until the chain leaves mapped
//! memory, hits a null return address or runs too deep. Part of the fault
//! diagnostics, so it must never fault itself.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn print_stack_trace() {
    use crate::memory::{page_address, paging};
    use crate::println;

    const MAX_FRAMES: usize = 32;

    let mut ebp: u32;
    unsafe {
        core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nomem, nostack));
    }

    println!("Stack trace:");
    let current = unsafe { &*paging::current_directory() };
    for _ in 0..MAX_FRAMES {
        if ebp == 0 || ebp % 4 != 0 || !current.is_mapped(page_address(ebp)) {
            break;
        }
        // A frame holds the caller's ebp at +0 and the return address at +4.
        let saved_ebp = unsafe { *(ebp as usize as *const u32) };
        let return_addr = unsafe { *((ebp + 4) as usize as *const u32) };
        if return_addr == 0 {
            break;
        }
        println!("  {:#x}", return_addr);
        if saved_ebp <= ebp {
            // The chain must walk up the stack; anything else is garbage.
            break;
        }
        ebp = saved_ebp;
    }
}

/// Nothing to walk on the test host.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn print_stack_trace() {}
