//! Programmable interval timer.
//!
//! Channel 0 of the PIT fires IRQ0 at [`FREQUENCY_HZ`]; every tick rotates
//! the scheduler ring.

use core::sync::atomic::{AtomicU32, Ordering};

use super::isr::Registers;
use crate::info;
use crate::tasks::scheduler::{self, SwitchReason};
use crate::arch;

/// Preemption frequency.
pub const FREQUENCY_HZ: u32 = 50;

const PIT_BASE_HZ: u32 = 1_193_180;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, square wave mode.
const PIT_SET: u8 = 0x36;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Program channel 0 for [`FREQUENCY_HZ`].
pub fn init() {
    let divisor = PIT_BASE_HZ / FREQUENCY_HZ;
    arch::outb(PIT_COMMAND, PIT_SET);
    arch::outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
    arch::outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    info!("timer running at {} Hz", FREQUENCY_HZ);
}

/// Ticks since boot.
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Timer interrupt body: count the tick and hand the frame to the
/// scheduler for the round-robin rotation.
pub fn on_tick(regs: &mut Registers) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    scheduler::schedule(regs, SwitchReason::Preempt);
}
