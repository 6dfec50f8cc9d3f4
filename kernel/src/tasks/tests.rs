use std::sync::MutexGuard;

use super::scheduler::{self, SwitchReason};
use super::task::{PageDir, Privilege, Signal, SignalMask, Task, TaskId};
use crate::interrupts::isr::Registers;
use crate::memory::frames::FRAME_ALLOCATOR;
use crate::memory::paging;
use crate::multiboot::{MEMORY_AVAILABLE, MemMapEntry};
use crate::syscall::{self, AllocPageFlags, KernelStatus, MapPageFlags};
use crate::test_support::lock_kernel_state;
use crate::{channel, gdt};

const EFLAGS_IF: u32 = 0x200;

/// Reset every kernel-global table and bring up a fresh scheduler over a
/// 64 MiB machine with the kernel in frame 0.
fn setup() -> MutexGuard<'static, ()> {
    let guard = lock_kernel_state();

    channel::teardown();
    scheduler::teardown();
    FRAME_ALLOCATOR.lock().init(
        64 * 1024,
        &[MemMapEntry {
            size: 20,
            addr: 0,
            len: 64 * 1024 * 1024,
            kind: MEMORY_AVAILABLE,
        }],
        0,
    );
    unsafe {
        (*paging::kernel_directory()).clear();
    }
    paging::switch_to(paging::kernel_directory());
    scheduler::init();

    guard
}

fn new_user_task() -> Task {
    let dir = unsafe { &*paging::kernel_directory() }.duplicate();
    Task::new(Privilege::User, PageDir::Owned(dir), Some(scheduler::main_kernel_task()))
}

fn spawn_user_task(entry: u32, arg: u32) -> TaskId {
    let mut task = new_user_task();
    task.set_entry(entry);
    task.set_arg(arg);
    scheduler::with(|s| {
        let id = s.insert_task(task);
        s.register_task(id);
        id
    })
}

/// A trap frame as the trampolines would have built it for a kernel task.
fn kernel_frame() -> Registers {
    let mut regs = Registers::zeroed();
    regs.cs = gdt::KERNEL_CODE as u32;
    regs.ds = gdt::KERNEL_DATA;
    regs.es = gdt::KERNEL_DATA;
    regs.fs = gdt::KERNEL_DATA;
    regs.gs = gdt::KERNEL_DATA;
    regs.ss = gdt::KERNEL_DATA as u32;
    regs
}

#[test]
fn selectors_follow_the_privilege_tag() {
    let _guard = setup();

    let kernel = Task::new(Privilege::Kernel, PageDir::Kernel, None);
    assert_eq!(kernel.regs().cs, gdt::KERNEL_CODE as u32);
    assert_eq!(kernel.regs().ds, gdt::KERNEL_DATA);

    let user = new_user_task();
    assert_eq!(user.regs().cs, (gdt::USER_CODE | gdt::RING3) as u32);
    assert_eq!(user.regs().ss, (gdt::USER_DATA | gdt::RING3) as u32);
    assert_eq!(user.regs().eip, 0);
}

#[test]
fn kernel_stack_base_is_word_aligned() {
    let _guard = setup();
    let task = new_user_task();
    assert_eq!(task.kernel_stack_base() % 4, 0);
}

#[test]
fn owned_frames_are_marked_in_the_allocator() {
    let _guard = setup();
    let mut task = new_user_task();

    let used_before = FRAME_ALLOCATOR.lock().num_used();
    task.record_owned_frame(3);
    assert!(task.page_is_recorded(3));
    assert!(FRAME_ALLOCATOR.lock().is_used(3));
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before + 1);

    task.remove_owned_frame(3);
    assert!(!task.page_is_recorded(3));
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before);
}

#[test]
fn registration_sends_ready_exactly_once() {
    let _guard = setup();
    let kernel_task = scheduler::main_kernel_task();

    let task = new_user_task();
    let child = scheduler::with(|s| s.insert_task(task));

    scheduler::with(|s| {
        s.wait_on(kernel_task, child, SignalMask::READY);
        assert!(!s.task(kernel_task).unwrap().can_run());
        s.register_task(child);

        let (kind, value, from) = s.task(kernel_task).unwrap().received_signal().unwrap();
        assert_eq!(kind, Signal::Ready);
        assert_eq!(value, 0);
        assert_eq!(from, child);
        assert!(s.task(kernel_task).unwrap().can_run());
    });
}

/// Repeated sends into one waiting pair coalesce: the last writer wins,
/// nothing queues.
#[test]
fn signal_delivery_coalesces() {
    let _guard = setup();
    let kernel_task = scheduler::main_kernel_task();
    let child = spawn_user_task(0x1000, 0);

    scheduler::with(|s| {
        s.wait_on(kernel_task, child, SignalMask::READY | SignalMask::RUNNING);
        s.send_signal(child, Signal::Ready, 11);
        s.send_signal(child, Signal::Running, 22);

        let (kind, value, _) = s.task(kernel_task).unwrap().received_signal().unwrap();
        assert_eq!(kind, Signal::Running);
        assert_eq!(value, 22);
    });
}

#[test]
fn wait_mask_widens_on_upsert() {
    let _guard = setup();
    let kernel_task = scheduler::main_kernel_task();
    let child = spawn_user_task(0x1000, 0);

    scheduler::with(|s| {
        s.wait_on(kernel_task, child, SignalMask::READY);
        s.wait_on(kernel_task, child, SignalMask::TERMINATED);
        let entries = s.task(kernel_task).unwrap().waiting_on();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mask, SignalMask::READY | SignalMask::TERMINATED);
    });
}

#[test]
#[should_panic(expected = "no waiting entry")]
fn removing_a_missing_signal_is_fatal() {
    let mut task = Task::new(Privilege::Kernel, PageDir::Kernel, None);
    task.remove_signal(42);
}

#[test]
fn round_robin_preserves_ring_order() {
    let _guard = setup();
    let a = spawn_user_task(0x1000, 7);
    let b = spawn_user_task(0x2000, 8);
    let kernel_task = scheduler::main_kernel_task();

    let mut frame = kernel_frame();
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), a);
    assert_eq!(frame.eip, 0x1000);
    assert_eq!(frame.eax, 7);
    assert_eq!(frame.cs, (gdt::USER_CODE | gdt::RING3) as u32);
    assert_ne!(frame.eflags & EFLAGS_IF, 0);
    assert_eq!(gdt::kernel_stack(), scheduler::with(|s| s.task(a).unwrap().kernel_stack_base()));

    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), b);
    assert_eq!(frame.eip, 0x2000);

    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), kernel_task);

    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), a);
}

#[test]
fn lone_kernel_task_keeps_running() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.eip = 0xABCD;
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(frame.eip, 0xABCD);
    assert_eq!(scheduler::current_task_id(), scheduler::main_kernel_task());
}

#[test]
fn selecting_a_task_sends_running() {
    let _guard = setup();
    let kernel_task = scheduler::main_kernel_task();
    let a = spawn_user_task(0x1000, 0);

    scheduler::with(|s| s.wait_on(kernel_task, a, SignalMask::RUNNING));
    let mut frame = kernel_frame();
    scheduler::schedule(&mut frame, SwitchReason::Preempt);

    scheduler::with(|s| {
        let (kind, _, from) = s.task(kernel_task).unwrap().received_signal().unwrap();
        assert_eq!(kind, Signal::Running);
        assert_eq!(from, a);
    });
}

#[test]
#[should_panic(expected = "bad cs")]
fn garbage_selectors_in_a_frame_are_fatal() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.cs = 0x1234;
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
}

/// Parent waits for the child to die; the child exits with 42. The parent
/// resumes with (Ok, Terminated, 42) in its result registers.
#[test]
fn wait_then_kill_delivers_the_exit_value() {
    let _guard = setup();
    let parent = spawn_user_task(0x1000, 0);
    let child = spawn_user_task(0x2000, 0);
    let kernel_task = scheduler::main_kernel_task();

    // Run the parent.
    let mut frame = kernel_frame();
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), parent);

    // Parent: ProcessWait(child, TERMINATED). Blocks; the frame moves on
    // to the child.
    frame.eax = 10;
    frame.ebx = child;
    frame.ecx = SignalMask::TERMINATED.bits();
    syscall::dispatch(&mut frame);
    assert_eq!(scheduler::current_task_id(), child);
    assert_eq!(frame.eip, 0x2000);

    // Child: ProcessKill(42). The child is destroyed on the spot.
    frame.eax = 1;
    frame.ebx = 42;
    syscall::dispatch(&mut frame);
    assert!(!scheduler::is_running(child));
    assert!(scheduler::with(|s| s.task(child).is_none()));

    // The walk happened before the terminate signal landed, so the kernel
    // task goes first; the next rotation resumes the parent with the
    // signal in its result registers.
    assert_eq!(scheduler::current_task_id(), kernel_task);
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), parent);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert_eq!(frame.ebx, Signal::Terminated as u32);
    assert_eq!(frame.ecx, 42);
    assert!(scheduler::with(|s| s.task(parent).unwrap().waiting_on().is_empty()));
}

/// ProcessWait with an empty mask returns immediately.
#[test]
fn wait_with_empty_mask_is_immediate() {
    let _guard = setup();
    let a = spawn_user_task(0x1000, 0);

    let mut frame = kernel_frame();
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), a);

    frame.eax = 10;
    frame.ebx = scheduler::main_kernel_task();
    frame.ecx = 0;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert_eq!(frame.ebx, 0);
    assert_eq!(frame.ecx, 0);
    // Still the same task; nothing blocked.
    assert_eq!(scheduler::current_task_id(), a);
}

/// Two tasks waiting on each other and nothing else to run: the scheduler
/// logs the deadlock and the kernel task carries on.
#[test]
fn mutual_waiters_deadlock_without_crashing() {
    let _guard = setup();
    let a = spawn_user_task(0x1000, 0);
    let b = spawn_user_task(0x2000, 0);
    let kernel_task = scheduler::main_kernel_task();

    scheduler::with(|s| {
        s.wait_on(a, b, SignalMask::TERMINATED);
        s.wait_on(b, a, SignalMask::TERMINATED);
    });

    let mut frame = kernel_frame();
    frame.eip = 0x777;
    scheduler::schedule(&mut frame, SwitchReason::Preempt);

    assert_eq!(scheduler::current_task_id(), kernel_task);
    assert_eq!(frame.eip, 0x777);
}

/// Killing a task releases every frame it owned and closes its endpoints.
#[test]
fn terminate_releases_owned_resources() {
    let _guard = setup();
    let a = spawn_user_task(0x1000, 0);

    let used_before = FRAME_ALLOCATOR.lock().num_used();
    scheduler::with(|s| {
        let task = s.task_mut(a).unwrap();
        task.record_owned_frame(4);
        task.record_owned_frame(5);
    });
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before + 2);
    let (h1, h2) = channel::create(a);

    let mut frame = kernel_frame();
    scheduler::schedule(&mut frame, SwitchReason::Preempt);
    assert_eq!(scheduler::current_task_id(), a);

    scheduler::schedule(&mut frame, SwitchReason::Terminate(1));
    assert!(!scheduler::is_running(a));
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before);
    assert_eq!(channel::live_channels(), 0);
    assert_eq!(channel::close(h1), Err(channel::InvalidHandle));
    let _ = h2;
}

#[test]
fn children_are_derived_from_the_ring() {
    let _guard = setup();
    let kernel_task = scheduler::main_kernel_task();
    let a = spawn_user_task(0x1000, 0);
    let b = spawn_user_task(0x2000, 0);

    // A created task that was never started is not a child yet.
    let unstarted = scheduler::with(|s| s.insert_task(new_user_task()));

    let children = scheduler::with(|s| s.children_of(kernel_task));
    assert_eq!(children, alloc::vec![a, b]);
    assert!(!children.contains(&unstarted));
}

#[test]
fn create_and_start_through_the_syscalls() {
    let _guard = setup();
    let mut frame = kernel_frame();

    frame.eax = 4; // ProcessCreate
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    let child = frame.ebx;
    assert!(!scheduler::is_running(child));

    frame.eax = 6; // ProcessStart
    frame.ebx = child;
    frame.ecx = 0x5000;
    frame.edx = 99;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert!(scheduler::is_running(child));
    scheduler::with(|s| {
        let task = s.task(child).unwrap();
        assert_eq!(task.regs().eip, 0x5000);
        assert_eq!(task.regs().eax, 99);
        assert_eq!(task.parent(), Some(s.kernel_task_id()));
    });

    // Starting an already-running task is an argument error.
    frame.eax = 6;
    frame.ebx = child;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::InvalidArg as u32);
}

/// The first anonymous allocation lands on the first free super-page at or
/// above index 1.
#[test]
fn first_anonymous_allocation_is_page_one() {
    let _guard = setup();
    let used_before = FRAME_ALLOCATOR.lock().num_used();

    let mut frame = kernel_frame();
    frame.eax = 2; // AllocPage
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = (AllocPageFlags::ANON | AllocPageFlags::CURRENT).bits();
    syscall::dispatch(&mut frame);

    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert_eq!(frame.ebx, 0x40_0000);
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before + 1);
}

#[test]
fn alloc_unmap_roundtrip_restores_the_tables() {
    let _guard = setup();
    let used_before = FRAME_ALLOCATOR.lock().num_used();

    let mut frame = kernel_frame();
    frame.eax = 2; // AllocPage
    frame.edx = (AllocPageFlags::ANON | AllocPageFlags::CURRENT).bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    let vaddr = frame.ebx;

    frame.eax = 7; // UnmapPage
    frame.ebx = vaddr;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before);
    assert!(!unsafe { &*paging::kernel_directory() }.is_mapped(vaddr));
    assert!(scheduler::with(|s| s.current().owned_frames().is_empty()));
}

#[test]
fn alloc_at_a_mapped_address_is_refused() {
    let _guard = setup();
    let mut frame = kernel_frame();

    frame.eax = 2;
    frame.ebx = 0;
    frame.edx = (AllocPageFlags::ANON | AllocPageFlags::CURRENT).bits();
    syscall::dispatch(&mut frame);
    let vaddr = frame.ebx;

    frame.eax = 2;
    frame.ebx = vaddr;
    frame.edx = AllocPageFlags::CURRENT.bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::VPageMapped as u32);
}

#[test]
fn alloc_with_a_bad_handle_is_refused() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.eax = 2;
    frame.ecx = 0xDEAD;
    frame.edx = AllocPageFlags::ANON.bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::InvalidHandle as u32);
}

#[test]
fn page_size_reports_4mib() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.eax = 3;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, 0x40_0000);
}

#[test]
fn channel_syscalls_hand_out_and_retire_handles() {
    let _guard = setup();
    let mut frame = kernel_frame();

    frame.eax = 11; // ChannelCreate
    syscall::dispatch(&mut frame);
    let (h1, h2) = (frame.eax, frame.ebx);
    assert_ne!(h1, 0);
    assert_ne!(h2, 0);
    assert_eq!(channel::owner(h1), Ok(scheduler::main_kernel_task()));

    frame.eax = 15; // TransferHandle
    frame.ebx = scheduler::main_kernel_task();
    frame.ecx = h2;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);

    frame.eax = 12; // HandleClose
    frame.ebx = h1;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);

    frame.eax = 12;
    frame.ebx = 0xBEEF;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::InvalidHandle as u32);
}

#[test]
#[should_panic(expected = "unknown syscall")]
fn unknown_syscall_numbers_are_fatal() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.eax = 999;
    syscall::dispatch(&mut frame);
}

/// MapPage aliases the caller's page into the other task and, with
/// SWAP_OWNER, moves the frame's ownership along.
#[test]
fn map_page_aliases_and_swaps_ownership() {
    let _guard = setup();
    let mut frame = kernel_frame();

    // Give the caller a page to share.
    frame.eax = 2; // AllocPage
    frame.edx = (AllocPageFlags::ANON | AllocPageFlags::CURRENT).bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    let vaddr1 = frame.ebx;

    frame.eax = 4; // ProcessCreate
    syscall::dispatch(&mut frame);
    let child = frame.ebx;

    let used_before = FRAME_ALLOCATOR.lock().num_used();
    frame.eax = 5; // MapPage
    frame.ebx = vaddr1;
    frame.ecx = child;
    frame.edx = 0;
    frame.esi = (MapPageFlags::ANON | MapPageFlags::SWAP_OWNER).bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    let vaddr2 = frame.ebx;
    assert_ne!(vaddr2, vaddr1);

    // Aliasing only: no new frame was consumed.
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_before);
    scheduler::with(|s| {
        let kernel_task = s.kernel_task_id();
        let frame_idx = {
            let child_task = s.task(child).unwrap();
            let dir = unsafe { &*child_task.page_dir() };
            assert!(dir.is_mapped(vaddr2));
            crate::memory::addr_to_page(dir.physical_of(vaddr2))
        };
        assert!(s.task(child).unwrap().page_is_recorded(frame_idx));
        assert!(!s.task(kernel_task).unwrap().page_is_recorded(frame_idx));
    });
}

#[test]
fn map_page_same_task_is_a_no_op() {
    let _guard = setup();
    let mut frame = kernel_frame();
    frame.eax = 5; // MapPage
    frame.ebx = 0x40_0000;
    frame.ecx = scheduler::main_kernel_task();
    frame.edx = 0x80_0000;
    frame.esi = 0;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    assert!(!unsafe { &*paging::kernel_directory() }.is_mapped(0x40_0000));
}

#[test]
fn map_page_rejects_unaligned_and_unmapped() {
    let _guard = setup();
    let mut frame = kernel_frame();

    frame.eax = 4; // ProcessCreate
    syscall::dispatch(&mut frame);
    let child = frame.ebx;

    frame.eax = 5; // MapPage, unaligned caller address
    frame.ebx = 0x1234;
    frame.ecx = child;
    frame.edx = 0x40_0000;
    frame.esi = 0;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::UnalignedPageAddr as u32);

    frame.eax = 5; // MapPage, neither side mapped
    frame.ebx = 0x40_0000;
    frame.ecx = child;
    frame.edx = 0x80_0000;
    frame.esi = 0;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::VPageMapped as u32);
}

/// Unmapping an alias the caller does not own must not free the frame.
#[test]
fn unmap_of_a_borrowed_page_keeps_the_frame() {
    let _guard = setup();
    let mut frame = kernel_frame();

    frame.eax = 2; // AllocPage
    frame.edx = (AllocPageFlags::ANON | AllocPageFlags::CURRENT).bits();
    syscall::dispatch(&mut frame);
    let vaddr = frame.ebx;

    let used_after_alloc = FRAME_ALLOCATOR.lock().num_used();

    // Move ownership away, then unmap the caller's view.
    frame.eax = 4; // ProcessCreate
    syscall::dispatch(&mut frame);
    let child = frame.ebx;

    frame.eax = 5; // MapPage
    frame.ebx = vaddr;
    frame.ecx = child;
    frame.esi = (MapPageFlags::ANON | MapPageFlags::SWAP_OWNER).bits();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);

    frame.eax = 7; // UnmapPage
    frame.ebx = vaddr;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::Ok as u32);
    // Still used: the child owns it now.
    assert_eq!(FRAME_ALLOCATOR.lock().num_used(), used_after_alloc);
    assert!(!unsafe { &*paging::kernel_directory() }.is_mapped(vaddr));
}

/// ProcessInfo reports the bytes a too-small buffer would need, without
/// touching it.
#[test]
fn process_info_sizes_its_results() {
    let _guard = setup();
    let a = spawn_user_task(0x1000, 0);
    let b = spawn_user_task(0x2000, 0);
    let _ = (a, b);

    let mut frame = kernel_frame();
    frame.eax = 8; // ProcessInfo
    frame.ebx = 0;
    frame.ecx = syscall::PROC_CHILDREN;
    frame.edx = 0;
    frame.esi = 0;
    // Two children of the kernel task: eight bytes required.
    frame.ebx = scheduler::main_kernel_task();
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::BufferTooSmall as u32);
    assert_eq!(frame.ebx, 8);

    frame.eax = 8;
    frame.ebx = 0xDEAD;
    frame.ecx = syscall::PROC_PARENT;
    syscall::dispatch(&mut frame);
    assert_eq!(frame.eax, KernelStatus::InvalidHandle as u32);
}

/// Channel buffers start small and grow past the initial capacity.
#[test]
fn channel_buffers_grow_past_initial_capacity() {
    let _guard = setup();
    let owner = scheduler::main_kernel_task();
    let (h1, h2) = channel::create(owner);

    let payload: alloc::vec::Vec<u8> = (0..=255).collect();
    channel::write(h1, &payload).unwrap();
    assert_eq!(channel::available(h2), Ok(256));

    let mut readback = [0u8; 256];
    assert_eq!(channel::read(h2, &mut readback), Ok(channel::ReadResult::Complete));
    assert_eq!(&readback[..], &payload[..]);
}
