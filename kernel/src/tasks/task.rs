//! The task object.
//!
//! A task is one thread of control owning one address space, one kernel
//! stack and a bounded set of physical frames. Tasks coordinate through
//! three signals (`Ready`, `Running`, `Terminated`) delivered into
//! `waiting_on` entries by the scheduler.

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::gdt;
use crate::interrupts::isr::Registers;
use crate::memory::frames::FRAME_ALLOCATOR;
use crate::memory::paging::{self, PageDirectory};

/// Opaque task identity; doubles as the user-visible handle. Zero is never
/// a valid id.
pub type TaskId = u32;

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 0x2000;

/// A task may own at most this many physical frames.
pub const MAX_OWNED_FRAMES: usize = 256;

/// Lifecycle signals, delivered from one task to another.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Signal {
    /// Enqueued in the ring but has not run yet.
    Ready = 0x1,
    /// Selected by the scheduler at least once.
    Running = 0x2,
    /// Being destroyed; carries the exit value.
    Terminated = 0x4,
}

bitflags! {
    /// Which signals a waiting task wants to hear about.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SignalMask: u32 {
        const READY = 0x1;
        const RUNNING = 0x2;
        const TERMINATED = 0x4;
    }
}

impl Signal {
    pub fn mask(self) -> SignalMask {
        SignalMask::from_bits_truncate(self as u32)
    }
}

/// Ring tag; selector sets are a lookup on this.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Privilege {
    Kernel,
    User,
}

impl Privilege {
    pub fn code_selector(self) -> u16 {
        match self {
            Privilege::Kernel => gdt::KERNEL_CODE,
            Privilege::User => gdt::USER_CODE | gdt::RING3,
        }
    }

    pub fn data_selector(self) -> u16 {
        match self {
            Privilege::Kernel => gdt::KERNEL_DATA,
            Privilege::User => gdt::USER_DATA | gdt::RING3,
        }
    }
}

/// A task's address space: its own directory, or the shared kernel one.
/// The kernel directory must never be freed with a task.
pub enum PageDir {
    Kernel,
    Owned(Box<PageDirectory>),
}

impl PageDir {
    pub fn ptr(&self) -> *mut PageDirectory {
        match self {
            PageDir::Kernel => paging::kernel_directory(),
            PageDir::Owned(dir) => &**dir as *const PageDirectory as *mut PageDirectory,
        }
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self, PageDir::Kernel)
    }
}

/// One `waiting_on` record: who we wait for, which signals qualify, and
/// what has arrived so far. A later send overwrites an already received
/// signal (last writer wins for a single waiting pair).
#[derive(Clone, Copy, Debug)]
pub struct WaitEntry {
    pub task: TaskId,
    pub mask: SignalMask,
    pub value: u32,
    pub received: Option<Signal>,
}

#[repr(align(16))]
pub(super) struct KernelStack(pub(super) [u8; KERNEL_STACK_SIZE]);

pub struct Task {
    privilege: Privilege,
    pub(super) regs: Registers,
    pub(super) page_dir: PageDir,
    pub(super) kernel_stack: Box<KernelStack>,
    parent: Option<TaskId>,
    owned_frames: ArrayVec<u32, MAX_OWNED_FRAMES>,
    pub(super) waiting_on: Vec<WaitEntry>,
    pub(super) listening_for: Vec<TaskId>,
}

impl Task {
    /// A fresh task with ring-appropriate segment selectors and a zeroed
    /// instruction pointer; `set_entry` configures where it starts.
    pub fn new(privilege: Privilege, page_dir: PageDir, parent: Option<TaskId>) -> Task {
        let mut regs = Registers::zeroed();
        let data = privilege.data_selector();
        regs.ds = data;
        regs.es = data;
        regs.fs = data;
        regs.gs = data;
        regs.ss = data as u32;
        regs.cs = privilege.code_selector() as u32;

        Task {
            privilege,
            regs,
            page_dir,
            kernel_stack: Box::new(KernelStack([0; KERNEL_STACK_SIZE])),
            parent,
            owned_frames: ArrayVec::new(),
            waiting_on: Vec::new(),
            listening_for: Vec::new(),
        }
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn is_user(&self) -> bool {
        self.privilege == Privilege::User
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        self.regs = *regs;
    }

    pub fn set_entry(&mut self, entry: u32) {
        self.regs.eip = entry;
    }

    /// On i386 the first argument rides in the accumulator.
    pub fn set_arg(&mut self, arg: u32) {
        self.regs.eax = arg;
    }

    pub fn page_dir(&self) -> *mut PageDirectory {
        self.page_dir.ptr()
    }

    pub fn page_dir_is_kernel(&self) -> bool {
        self.page_dir.is_kernel()
    }

    /// High end of this task's kernel stack; the stack grows down from it.
    pub fn kernel_stack_base(&self) -> u32 {
        let base = self.kernel_stack.0.as_ptr() as usize + KERNEL_STACK_SIZE;
        debug_assert!(base % core::mem::size_of::<usize>() == 0, "kernel stack is not word aligned");
        base as u32
    }

    /// Record a frame as exclusively owned by this task and mark it used
    /// in the global allocator. A task out of table space is beyond saving.
    pub fn record_owned_frame(&mut self, frame: u32) {
        assert!(!self.page_is_recorded(frame), "physical frame already recorded");
        if self.owned_frames.try_push(frame).is_err() {
            panic!("unable to record any more frames for this task");
        }
        FRAME_ALLOCATOR.lock().mark_used(frame);
    }

    /// Forget an owned frame and free it.
    pub fn remove_owned_frame(&mut self, frame: u32) {
        let index = self
            .owned_frames
            .iter()
            .position(|&f| f == frame)
            .expect("physical frame not recorded");
        self.owned_frames.swap_remove(index);
        FRAME_ALLOCATOR.lock().mark_free(frame);
    }

    pub fn page_is_recorded(&self, frame: u32) -> bool {
        self.owned_frames.contains(&frame)
    }

    pub fn owned_frames(&self) -> &[u32] {
        &self.owned_frames
    }

    /// Add (or widen) a waiting entry for `target`.
    pub(super) fn upsert_wait(&mut self, target: TaskId, mask: SignalMask) {
        if let Some(entry) = self.waiting_on.iter_mut().find(|e| e.task == target) {
            entry.mask |= mask;
            return;
        }
        self.waiting_on.push(WaitEntry {
            task: target,
            mask,
            value: 0,
            received: None,
        });
    }

    /// Accept `kind` from `from` if a waiting entry wants it. Overwrites a
    /// previously received signal: delivery coalesces, it does not queue.
    pub(super) fn deliver(&mut self, from: TaskId, kind: Signal, value: u32) -> bool {
        if let Some(entry) = self
            .waiting_on
            .iter_mut()
            .find(|e| e.task == from && e.mask.contains(kind.mask()))
        {
            entry.received = Some(kind);
            entry.value = value;
            true
        } else {
            false
        }
    }

    /// Any fulfilled waiting entry, in no particular order.
    pub fn received_signal(&self) -> Option<(Signal, u32, TaskId)> {
        self.waiting_on
            .iter()
            .find(|e| e.received.is_some())
            .map(|e| (e.received.unwrap(), e.value, e.task))
    }

    /// Runnable iff not waiting, or at least one awaited signal arrived.
    pub fn can_run(&self) -> bool {
        self.waiting_on.is_empty() || self.waiting_on.iter().any(|e| e.received.is_some())
    }

    /// Drop the waiting entry for `from`. Asking to drop an entry that was
    /// never created is a kernel bug.
    pub fn remove_signal(&mut self, from: TaskId) {
        let index = self
            .waiting_on
            .iter()
            .position(|e| e.task == from)
            .expect("no waiting entry for that task");
        self.waiting_on.remove(index);
    }

    pub fn waiting_on(&self) -> &[WaitEntry] {
        &self.waiting_on
    }

    /// Give back every frame this task still owns.
    pub(super) fn release_resources(&mut self) {
        let mut allocator = FRAME_ALLOCATOR.lock();
        for frame in self.owned_frames.drain(..) {
            assert!(allocator.is_used(frame));
            allocator.mark_free(frame);
        }
    }
}
