//! Syscall interface for user programs.
//!
//! Syscalls enter through `int 0x80`. Calling convention:
//! - eax: syscall number
//! - ebx: arg1
//! - ecx: arg2
//! - edx: arg3
//! - esi: arg4
//!
//! The result status returns in eax; ebx and ecx carry additional outputs
//! where documented. Handlers treat every argument register as untrusted:
//! bad alignment, unmapped addresses and unknown handles come back as
//! statuses, never as kernel faults. Traps run on the kernel directory, so
//! all user-memory traffic goes through the cross-space copy against the
//! caller's directory.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::channel::{self, ReadResult};
use crate::interrupts::isr::Registers;
use crate::memory::frames::FRAME_ALLOCATOR;
use crate::memory::paging::{self, CopyError, PageFlags};
use crate::memory::{PAGE_SIZE, addr_to_page, page_address, page_to_addr};
use crate::tasks::scheduler::{self, SwitchReason};
use crate::tasks::task::{PageDir, Privilege, SignalMask, Task, TaskId};
use crate::{print, serial, trace};

/// Exit statuses of every syscall, returned in eax.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum KernelStatus {
    Ok = 0,
    /// Out of physical memory.
    OomPhys = 1,
    /// No virtual super-page left in the target address space.
    OomVirt = 2,
    /// The virtual address to map is already mapped (or the mapping state
    /// does not match what the call requires).
    VPageMapped = 3,
    /// The buffer passed to a syscall is too small.
    BufferTooSmall = 4,
    /// A handle argument did not resolve.
    InvalidHandle = 5,
    /// An address that must be page-aligned is not.
    UnalignedPageAddr = 6,
    /// A read produced nothing.
    UnableToRead = 7,
    /// Some other argument was invalid.
    InvalidArg = 8,
}

bitflags! {
    /// `AllocPage` flag set (arg3).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AllocPageFlags: u32 {
        /// Pick the lowest free virtual page instead of the requested one.
        const ANON = 0x1;
        /// Target the calling task; the handle argument is ignored.
        const CURRENT = 0x2;
    }
}

bitflags! {
    /// `MapPage` flag set (arg4).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapPageFlags: u32 {
        /// Move ownership of the frame to the newly-mapped-in task.
        const SWAP_OWNER = 0x1;
        /// Pick a free page in the other address space; arg3 is ignored.
        const ANON = 0x2;
    }
}

/// `ProcessInfo` query kinds.
pub const PROC_CURRENT: u32 = 0;
pub const PROC_PARENT: u32 = 1;
pub const PROC_CHILDREN: u32 = 2;

/// Anonymous page placement never hands out virtual page zero.
const FREE_PAGE_LOWER_BOUND: u32 = 1;

/// Upper bound on a `DebugWrite` string; past this with no terminator the
/// call fails instead of wandering through the address space.
const MAX_DEBUG_WRITE: usize = 0x1_0000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Syscall {
    DebugWrite = 0,
    ProcessKill = 1,
    AllocPage = 2,
    PageSize = 3,
    ProcessCreate = 4,
    MapPage = 5,
    ProcessStart = 6,
    UnmapPage = 7,
    ProcessInfo = 8,
    DebugRead = 9,
    ProcessWait = 10,
    ChannelCreate = 11,
    HandleClose = 12,
    ChannelRead = 13,
    ChannelWrite = 14,
    TransferHandle = 15,
}

impl Syscall {
    pub fn from_u32(n: u32) -> Option<Self> {
        Some(match n {
            0 => Syscall::DebugWrite,
            1 => Syscall::ProcessKill,
            2 => Syscall::AllocPage,
            3 => Syscall::PageSize,
            4 => Syscall::ProcessCreate,
            5 => Syscall::MapPage,
            6 => Syscall::ProcessStart,
            7 => Syscall::UnmapPage,
            8 => Syscall::ProcessInfo,
            9 => Syscall::DebugRead,
            10 => Syscall::ProcessWait,
            11 => Syscall::ChannelCreate,
            12 => Syscall::HandleClose,
            13 => Syscall::ChannelRead,
            14 => Syscall::ChannelWrite,
            15 => Syscall::TransferHandle,
            _ => return None,
        })
    }
}

/// Route one trap from the syscall vector.
pub fn dispatch(regs: &mut Registers) {
    let Some(syscall) = Syscall::from_u32(regs.eax) else {
        // An unknown number means the caller's syscall stubs are broken
        // beyond any sensible recovery.
        panic!("unknown syscall {} from task {}", regs.eax, scheduler::current_task_id());
    };

    trace!(
        "syscall {:?}(ebx={:#x}, ecx={:#x}, edx={:#x}, esi={:#x})",
        syscall, regs.ebx, regs.ecx, regs.edx, regs.esi
    );

    match syscall {
        Syscall::DebugWrite => sys_debug_write(regs),
        Syscall::ProcessKill => sys_process_kill(regs),
        Syscall::AllocPage => sys_alloc_page(regs),
        Syscall::PageSize => sys_page_size(regs),
        Syscall::ProcessCreate => sys_process_create(regs),
        Syscall::MapPage => sys_map_page(regs),
        Syscall::ProcessStart => sys_process_start(regs),
        Syscall::UnmapPage => sys_unmap_page(regs),
        Syscall::ProcessInfo => sys_process_info(regs),
        Syscall::DebugRead => sys_debug_read(regs),
        Syscall::ProcessWait => sys_process_wait(regs),
        Syscall::ChannelCreate => sys_channel_create(regs),
        Syscall::HandleClose => sys_handle_close(regs),
        Syscall::ChannelRead => sys_channel_read(regs),
        Syscall::ChannelWrite => sys_channel_write(regs),
        Syscall::TransferHandle => sys_transfer_handle(regs),
    }
}

// ---------------------------------------------------------------------------
// User-memory access. The caller's directory is not installed while the
// kernel handles a trap, so every transfer stages through the cross-space
// copy; a page without a mapping in the caller's directory fails the call.

fn caller_page_dir() -> *mut paging::PageDirectory {
    scheduler::with(|s| s.current().page_dir())
}

fn status_of(err: CopyError) -> KernelStatus {
    match err {
        CopyError::NotMapped => KernelStatus::InvalidArg,
        CopyError::NoWindow => KernelStatus::OomVirt,
    }
}

fn copy_from_user(src: u32, dst: &mut [u8]) -> Result<(), KernelStatus> {
    if dst.is_empty() {
        return Ok(());
    }
    let user_pd = caller_page_dir();
    unsafe {
        paging::copy_between(
            user_pd,
            paging::current_directory(),
            src,
            dst.as_mut_ptr() as usize as u32,
            dst.len(),
        )
    }
    .map_err(status_of)
}

fn copy_to_user(dst: u32, src: &[u8]) -> Result<(), KernelStatus> {
    if src.is_empty() {
        return Ok(());
    }
    let user_pd = caller_page_dir();
    unsafe {
        paging::copy_between(
            paging::current_directory(),
            user_pd,
            src.as_ptr() as usize as u32,
            dst,
            src.len(),
        )
    }
    .map_err(status_of)
}

/// Whether `[addr, addr + len)` is fully mapped in the caller's space.
fn user_range_mapped(addr: u32, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    let user_pd = caller_page_dir();
    let last = addr.checked_add(len as u32 - 1);
    let Some(last) = last else {
        return false;
    };
    let mut page = page_address(addr);
    loop {
        if !unsafe { &*user_pd }.is_mapped(page) {
            return false;
        }
        if page == page_address(last) {
            return true;
        }
        page += PAGE_SIZE;
    }
}

/// Read a NUL-terminated string out of the caller's address space.
fn read_user_cstr(mut src: u32) -> Result<Vec<u8>, KernelStatus> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 128];
    loop {
        // Never read across an unmapped boundary: clamp each chunk to the
        // super-page the cursor is on.
        let room = (PAGE_SIZE - (src - page_address(src))) as usize;
        let take = chunk.len().min(room);
        copy_from_user(src, &mut chunk[..take])?;
        if let Some(nul) = chunk[..take].iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..take]);
        if out.len() > MAX_DEBUG_WRITE {
            return Err(KernelStatus::InvalidArg);
        }
        src = src.checked_add(take as u32).ok_or(KernelStatus::InvalidArg)?;
    }
}

// ---------------------------------------------------------------------------
// Handlers.

/// 0: print a NUL-terminated string from user memory.
///
///   ebx - pointer to the bytes in the caller's address space.
fn sys_debug_write(regs: &mut Registers) {
    match read_user_cstr(regs.ebx) {
        Ok(bytes) => {
            print!("{}", core::str::from_utf8(&bytes).unwrap_or("<invalid utf-8>"));
            regs.eax = KernelStatus::Ok as u32;
        }
        Err(status) => regs.eax = status as u32,
    }
}

/// 1: terminate the calling task.
///
///   ebx - 32-bit exit value delivered to waiting listeners.
///
/// Does not return to the caller; the frame leaves holding the next task.
fn sys_process_kill(regs: &mut Registers) {
    let exit_value = regs.ebx;
    trace!("killing task {}", scheduler::current_task_id());
    scheduler::schedule(regs, SwitchReason::Terminate(exit_value));
}

/// 2: allocate a physical frame and map it into a task's address space.
///
///   ebx - desired virtual address (ignored with ALLOC_ANON)
///   ecx - target task handle (ignored with ALLOC_CURRENT)
///   edx - AllocPageFlags
///
/// Returns eax = status, ebx = the virtual address mapped.
fn sys_alloc_page(regs: &mut Registers) {
    let requested_vaddr = regs.ebx;
    let handle = regs.ecx;
    let flags = AllocPageFlags::from_bits_truncate(regs.edx);

    let (status, vaddr) = scheduler::with(|s| {
        let target = if flags.contains(AllocPageFlags::CURRENT) {
            s.current_id()
        } else {
            handle as TaskId
        };
        if s.task(target).is_none() {
            return (KernelStatus::InvalidHandle, 0);
        }

        let Some(frame) = FRAME_ALLOCATOR.lock().next_free() else {
            return (KernelStatus::OomPhys, 0);
        };

        let task = s.task_mut(target).expect("target vanished");
        let dir = unsafe { &mut *task.page_dir() };
        let vaddr = if flags.contains(AllocPageFlags::ANON) {
            match dir.next_free_entry(FREE_PAGE_LOWER_BOUND) {
                Some(page) => page_to_addr(page),
                None => return (KernelStatus::OomVirt, 0),
            }
        } else {
            if requested_vaddr % PAGE_SIZE != 0 {
                return (KernelStatus::UnalignedPageAddr, 0);
            }
            if dir.is_mapped(requested_vaddr) {
                return (KernelStatus::VPageMapped, 0);
            }
            requested_vaddr
        };

        dir.map(vaddr, page_to_addr(frame), PageFlags::USER);
        task.record_owned_frame(frame);
        (KernelStatus::Ok, vaddr)
    });

    regs.eax = status as u32;
    if status == KernelStatus::Ok {
        regs.ebx = vaddr;
    }
}

/// 3: the fixed page size, in eax.
fn sys_page_size(regs: &mut Registers) {
    regs.eax = PAGE_SIZE;
}

/// 4: create (but do not start) a user task.
///
/// Returns eax = status, ebx = the new task's handle.
fn sys_process_create(regs: &mut Registers) {
    let user_pd = unsafe { &*paging::kernel_directory() }.duplicate();
    let (status, handle) = scheduler::with(|s| {
        let parent = s.current_id();
        let task = Task::new(Privilege::User, PageDir::Owned(user_pd), Some(parent));
        let id = s.insert_task(task);
        (KernelStatus::Ok, id)
    });
    regs.eax = status as u32;
    regs.ebx = handle;
}

/// 5: alias one task's mapped page into another task's address space.
///
///   ebx - virtual address in the caller
///   ecx - other task handle
///   edx - virtual address in the other task (ignored with MAP_ANON)
///   esi - MapPageFlags
///
/// Exactly one of the two addresses must be mapped; the other becomes the
/// alias. Returns eax = status, ebx = the other task's virtual address.
fn sys_map_page(regs: &mut Registers) {
    let vaddr1 = regs.ebx;
    let handle = regs.ecx;
    let vaddr2_arg = regs.edx;
    let flags = MapPageFlags::from_bits_truncate(regs.esi);

    let (status, result_vaddr) = scheduler::with(|s| {
        let task1 = s.current_id();
        let task2 = handle as TaskId;
        if s.task(task2).is_none() {
            return (KernelStatus::InvalidHandle, 0);
        }
        if task1 == task2 {
            // Same address space on both sides; nothing to do.
            return (KernelStatus::Ok, vaddr2_arg);
        }

        let (first, second) = s.task_pair_mut(task1, task2).expect("tasks vanished");
        let dir1_ptr = first.page_dir();
        let dir2_ptr = second.page_dir();
        assert!(!core::ptr::eq(dir1_ptr, dir2_ptr), "distinct tasks share an address space");
        let dir1 = unsafe { &mut *dir1_ptr };
        let dir2 = unsafe { &mut *dir2_ptr };

        let vaddr2 = if flags.contains(MapPageFlags::ANON) {
            match dir2.next_free_entry(FREE_PAGE_LOWER_BOUND) {
                Some(page) => page_to_addr(page),
                None => return (KernelStatus::OomVirt, 0),
            }
        } else {
            vaddr2_arg
        };

        if vaddr1 % PAGE_SIZE != 0 || vaddr2 % PAGE_SIZE != 0 {
            return (KernelStatus::UnalignedPageAddr, 0);
        }

        // Exactly one side must already have a physical page behind it.
        let (paddr, swap) = match (dir1.is_mapped(vaddr1), dir2.is_mapped(vaddr2)) {
            (true, false) => {
                let paddr = dir1.physical_of(vaddr1);
                dir2.map(vaddr2, paddr, PageFlags::USER);
                (paddr, (task1, task2))
            }
            (false, true) => {
                let paddr = dir2.physical_of(vaddr2);
                dir1.map(vaddr1, paddr, PageFlags::USER);
                (paddr, (task2, task1))
            }
            _ => return (KernelStatus::VPageMapped, 0),
        };

        if flags.contains(MapPageFlags::SWAP_OWNER) {
            let frame = addr_to_page(paddr);
            let (old_owner, new_owner) = swap;
            s.task_mut(old_owner)
                .expect("owner vanished")
                .remove_owned_frame(frame);
            s.task_mut(new_owner)
                .expect("new owner vanished")
                .record_owned_frame(frame);
        }

        (KernelStatus::Ok, vaddr2)
    });

    regs.eax = status as u32;
    if status == KernelStatus::Ok {
        regs.ebx = result_vaddr;
    }
}

/// 6: configure a created task's entry point and argument and put it on
/// the ring.
///
///   ebx - task handle
///   ecx - entry address
///   edx - initial value for the task's accumulator
fn sys_process_start(regs: &mut Registers) {
    let handle = regs.ebx as TaskId;
    let entry = regs.ecx;
    let arg = regs.edx;

    regs.eax = scheduler::with(|s| {
        if s.task(handle).is_none() {
            return KernelStatus::InvalidHandle;
        }
        if s.is_running(handle) {
            return KernelStatus::InvalidArg;
        }
        let task = s.task_mut(handle).expect("task vanished");
        task.set_entry(entry);
        task.set_arg(arg);
        s.register_task(handle);
        KernelStatus::Ok
    }) as u32;
}

/// 7: unmap a page of the caller; the frame is freed iff the caller owns it.
///
///   ebx - virtual address in the caller's address space.
fn sys_unmap_page(regs: &mut Registers) {
    let vaddr = regs.ebx;

    regs.eax = scheduler::with(|s| {
        if vaddr % PAGE_SIZE != 0 {
            return KernelStatus::UnalignedPageAddr;
        }
        let task = s.current_mut();
        let dir = unsafe { &mut *task.page_dir() };
        if !dir.is_mapped(vaddr) {
            return KernelStatus::InvalidArg;
        }
        let frame = addr_to_page(dir.physical_of(vaddr));
        if task.page_is_recorded(frame) {
            task.remove_owned_frame(frame);
        }
        dir.unmap(vaddr);
        KernelStatus::Ok
    }) as u32;
}

/// 8: query task relationships.
///
///   ebx - task handle (ignored with PROC_CURRENT)
///   ecx - PROC_CURRENT, PROC_PARENT or PROC_CHILDREN
///   edx - user-space buffer
///   esi - buffer size in bytes
///
/// Writes a packed array of handles. Returns eax = status and ebx = bytes
/// written, or bytes required on BufferTooSmall.
fn sys_process_info(regs: &mut Registers) {
    let handle = regs.ebx as TaskId;
    let kind = regs.ecx;
    let buffer = regs.edx;
    let buffer_size = regs.esi as usize;

    let handles: Result<Vec<TaskId>, KernelStatus> = scheduler::with(|s| {
        let target = if kind == PROC_CURRENT { s.current_id() } else { handle };
        if !s.is_running(target) {
            return Err(KernelStatus::InvalidHandle);
        }
        match kind {
            PROC_CURRENT => Ok(vec![target]),
            PROC_PARENT => Ok(vec![
                s.task(target).expect("target vanished").parent().unwrap_or(0),
            ]),
            PROC_CHILDREN => Ok(s.children_of(target)),
            _ => Err(KernelStatus::InvalidArg),
        }
    });

    let handles = match handles {
        Ok(handles) => handles,
        Err(status) => {
            regs.eax = status as u32;
            return;
        }
    };

    let mut bytes = Vec::with_capacity(handles.len() * 4);
    for handle in &handles {
        bytes.extend_from_slice(&handle.to_le_bytes());
    }

    if buffer_size < bytes.len() {
        regs.eax = KernelStatus::BufferTooSmall as u32;
        regs.ebx = bytes.len() as u32;
        return;
    }
    match copy_to_user(buffer, &bytes) {
        Ok(()) => {
            regs.eax = KernelStatus::Ok as u32;
            regs.ebx = bytes.len() as u32;
        }
        Err(status) => regs.eax = status as u32,
    }
}

/// 9: non-blocking read of one character from serial input.
///
///   ebx - pointer to one byte in the caller's address space.
fn sys_debug_read(regs: &mut Registers) {
    let byte = crate::arch::without_interrupts(|| serial::SERIAL1.lock().try_read());
    match byte {
        Some(byte) => match copy_to_user(regs.ebx, &[byte]) {
            Ok(()) => regs.eax = KernelStatus::Ok as u32,
            Err(status) => regs.eax = status as u32,
        },
        None => regs.eax = KernelStatus::UnableToRead as u32,
    }
}

/// 10: block until a task signals one of the masked states.
///
///   ebx - task handle to wait on
///   ecx - SignalMask of acceptable states
///
/// On wake: eax = Ok, ebx = the signal kind received, ecx = the value the
/// sender attached. An empty mask returns Ok immediately.
fn sys_process_wait(regs: &mut Registers) {
    let handle = regs.ebx as TaskId;
    let mask = SignalMask::from_bits_truncate(regs.ecx);

    let blocked = scheduler::with(|s| {
        if s.task(handle).is_none() {
            regs.eax = KernelStatus::InvalidHandle as u32;
            return false;
        }
        if mask.is_empty() {
            regs.eax = KernelStatus::Ok as u32;
            regs.ebx = 0;
            regs.ecx = 0;
            return false;
        }

        let waiter = s.current_id();
        s.wait_on(waiter, handle, mask);
        // The frame is the continuation: when a signal fulfills the wait,
        // the scheduler drops the kind and value into ebx/ecx before the
        // task runs again.
        regs.eax = KernelStatus::Ok as u32;
        true
    });

    if blocked {
        scheduler::schedule(regs, SwitchReason::Preempt);
    }
}

/// 11: create a channel. Both endpoint handles return to the caller:
/// eax = end 1, ebx = end 2.
fn sys_channel_create(regs: &mut Registers) {
    let owner = scheduler::current_task_id();
    let (end1, end2) = channel::create(owner);
    regs.eax = end1;
    regs.ebx = end2;
}

/// 12: close a channel endpoint.
///
///   ebx - endpoint handle.
fn sys_handle_close(regs: &mut Registers) {
    regs.eax = match channel::close(regs.ebx) {
        Ok(_) => KernelStatus::Ok as u32,
        Err(_) => KernelStatus::InvalidHandle as u32,
    };
}

/// 13: read from a channel endpoint.
///
///   ebx - endpoint handle
///   ecx - destination buffer in the caller's address space
///   edx - byte count
///
/// eax = Ok on success; on BufferTooSmall, ebx = bytes currently available.
fn sys_channel_read(regs: &mut Registers) {
    let handle = regs.ebx;
    let dst = regs.ecx;
    let count = regs.edx as usize;

    let available = match channel::available(handle) {
        Ok(available) => available,
        Err(_) => {
            regs.eax = KernelStatus::InvalidHandle as u32;
            return;
        }
    };
    if available < count {
        regs.eax = KernelStatus::BufferTooSmall as u32;
        regs.ebx = available as u32;
        return;
    }
    if !user_range_mapped(dst, count) {
        regs.eax = KernelStatus::InvalidArg as u32;
        return;
    }

    let mut staging = vec![0u8; count];
    match channel::read(handle, &mut staging) {
        Ok(ReadResult::Complete) => {
            copy_to_user(dst, &staging).expect("validated destination became unmapped");
            regs.eax = KernelStatus::Ok as u32;
        }
        Ok(ReadResult::Short(available)) => {
            regs.eax = KernelStatus::BufferTooSmall as u32;
            regs.ebx = available as u32;
        }
        Err(_) => regs.eax = KernelStatus::InvalidHandle as u32,
    }
}

/// 14: write to a channel endpoint.
///
///   ebx - endpoint handle
///   ecx - source buffer in the caller's address space
///   edx - byte count
fn sys_channel_write(regs: &mut Registers) {
    let handle = regs.ebx;
    let src = regs.ecx;
    let count = regs.edx as usize;

    if channel::owner(handle).is_err() {
        regs.eax = KernelStatus::InvalidHandle as u32;
        return;
    }
    if !user_range_mapped(src, count) {
        regs.eax = KernelStatus::InvalidArg as u32;
        return;
    }

    let mut staging = vec![0u8; count];
    if let Err(status) = copy_from_user(src, &mut staging) {
        regs.eax = status as u32;
        return;
    }
    match channel::write(handle, &staging) {
        Ok(()) => regs.eax = KernelStatus::Ok as u32,
        Err(_) => regs.eax = KernelStatus::InvalidHandle as u32,
    }
}

/// 15: hand a channel endpoint to another task.
///
///   ebx - recipient task handle
///   ecx - endpoint handle
fn sys_transfer_handle(regs: &mut Registers) {
    let task = regs.ebx as TaskId;
    let endpoint = regs.ecx;

    let task_exists = scheduler::with(|s| s.task(task).is_some());
    if !task_exists {
        regs.eax = KernelStatus::InvalidHandle as u32;
        return;
    }
    regs.eax = match channel::transfer_owner(endpoint, task) {
        Ok(()) => KernelStatus::Ok as u32,
        Err(_) => KernelStatus::InvalidHandle as u32,
    };
}
