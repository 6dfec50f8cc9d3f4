//! Interrupt handling for kestrel.
//!
//! This module provides:
//! - Interrupt Descriptor Table setup (`idt`)
//! - Legacy 8259 PIC remapping and EOI (`pic`)
//! - The PIT timer driving preemption (`timer`)
//! - The trap frame and per-vector trampolines (`isr`)
//! - The dispatcher routing every trap to the right subsystem

pub mod idt;
pub mod isr;
pub mod pic;
pub mod timer;

use isr::Registers;

use crate::memory::paging;
use crate::tasks::scheduler::{self, SwitchReason};
use crate::{arch, memory, print, println, syscall};

/// IRQ lines are remapped to start at this vector.
pub const IRQ_BASE: u32 = 32;
/// First vector past the remapped IRQ range.
pub const IRQ_LIMIT: u32 = 48;
/// The synchronous trap user code enters the kernel through.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// What the trap dispatcher should do after an exception handler ran.
///
/// Handlers report their decision upward instead of aborting in place, so
/// the single dispatch point below chooses between resuming, scheduling the
/// faulting task out for good, and halting the machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerOutcome {
    /// Resume whatever the frame now holds.
    Continue,
    /// Kill the current task with this exit value and run the next one.
    TerminateCurrent(u32),
    /// Unrecoverable; the dispatcher panics with this diagnostic.
    Panic(&'static str),
}

const EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debugger",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bounds",
    "Invalid Opcode",
    "Coprocessor Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid Task State Segment",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "Math Fault",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

const PAGE_FAULT_VECTOR: u32 = 14;

pub fn exception_name(int_no: u32) -> &'static str {
    EXCEPTION_NAMES.get(int_no as usize).copied().unwrap_or("Unknown")
}

/// Install the IDT, the trampolines, the PIC remap and the timer.
pub fn init() {
    idt::init();
    isr::install();
    pic::init();
    timer::init();
}

/// Route one trap. Runs with interrupts disabled on the kernel directory;
/// the chosen task's directory is reinstalled before returning to the
/// restore path.
pub fn dispatch(regs: &mut Registers) {
    debug_assert!(!arch::interrupts_enabled());

    paging::switch_to(paging::kernel_directory());

    match regs.int_no {
        n if n == SYSCALL_VECTOR as u32 => syscall::dispatch(regs),
        n if (IRQ_BASE..IRQ_LIMIT).contains(&n) => handle_irq(regs),
        n if n < 32 => {
            let outcome = handle_exception(regs);
            apply_outcome(regs, outcome);
        }
        n => panic!("trap from unknown vector {}", n),
    }

    if scheduler::is_initialized() {
        paging::switch_to(scheduler::current_page_dir());
    }
}

fn handle_irq(regs: &mut Registers) {
    let irq = (regs.int_no - IRQ_BASE) as u8;
    pic::end_of_interrupt(irq);
    match irq {
        0 => timer::on_tick(regs),
        // Everything else is masked; a stray line is logged and dropped.
        _ => crate::trace!("ignoring interrupt on irq {}", irq),
    }
}

fn handle_exception(regs: &mut Registers) -> HandlerOutcome {
    if regs.int_no == PAGE_FAULT_VECTOR {
        return paging::page_fault(regs);
    }
    unhandled_exception(regs)
}

fn unhandled_exception(regs: &mut Registers) -> HandlerOutcome {
    println!(
        "unhandled exception {} in task {}: {}",
        regs.int_no,
        scheduler::current_task_id(),
        exception_name(regs.int_no),
    );
    regs.dump();
    unsafe { &*scheduler::current_page_dir() }.dump_mapped();
    crate::stacktrace::print_stack_trace();

    if scheduler::current_is_user() {
        // Kill the offending task; the system carries on.
        HandlerOutcome::TerminateCurrent(1)
    } else {
        memory::FRAME_ALLOCATOR.lock().dump();
        HandlerOutcome::Panic("unhandled exception in the kernel")
    }
}

fn apply_outcome(regs: &mut Registers, outcome: HandlerOutcome) {
    match outcome {
        HandlerOutcome::Continue => {}
        HandlerOutcome::TerminateCurrent(exit_value) => {
            print!("task {} killed, exit value {}\n", scheduler::current_task_id(), exit_value);
            scheduler::schedule(regs, SwitchReason::Terminate(exit_value));
        }
        HandlerOutcome::Panic(message) => panic!("{}", message),
    }
}
