//! Round-robin scheduler.
//!
//! Tasks live in an arena of stable slots; the ring is a `VecDeque` of task
//! ids whose front is the current task. Rotation preserves ring order, so
//! scheduling is strictly round-robin with non-runnable tasks skipped. The
//! main kernel task is created at init, never leaves the ring and is the
//! fallback when no user task can run.

use alloc::collections::vec_deque::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use super::task::{PageDir, Privilege, Signal, SignalMask, Task, TaskId};
use crate::arch::InterruptGuard;
use crate::interrupts::isr::Registers;
use crate::memory::paging::{self, PageDirectory};
use crate::{channel, gdt, info, trace, warn};

const EFLAGS_IF: u32 = 0x200;

/// Why the scheduler was entered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SwitchReason {
    /// Timer tick or voluntary yield: save the frame and rotate.
    Preempt,
    /// The current task is done; destroy it, carrying this exit value.
    Terminate(u32),
}

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

pub struct Scheduler {
    slots: Vec<Option<Task>>,
    ring: VecDeque<TaskId>,
    kernel_task: TaskId,
    /// The task most recently destroyed. Dropping it is deferred one
    /// destruction because the frame being restored on the way out of the
    /// trap still lives on that task's kernel stack.
    graveyard: Option<Task>,
}

impl Scheduler {
    /// Store a task and hand out its id. The task is not in the ring yet.
    pub fn insert_task(&mut self, task: Task) -> TaskId {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(task);
            (index + 1) as TaskId
        } else {
            self.slots.push(Some(task));
            self.slots.len() as TaskId
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        let index = (id as usize).checked_sub(1)?;
        self.slots.get(index)?.as_ref()
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let index = (id as usize).checked_sub(1)?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Two distinct tasks, both mutably. Needed when a syscall maps one
    /// address space into another.
    pub fn task_pair_mut(&mut self, a: TaskId, b: TaskId) -> Option<(&mut Task, &mut Task)> {
        assert_ne!(a, b);
        let a_index = (a as usize).checked_sub(1)?;
        let b_index = (b as usize).checked_sub(1)?;
        if a_index.max(b_index) >= self.slots.len() {
            return None;
        }
        let (low, high, swapped) = if a_index < b_index {
            (a_index, b_index, false)
        } else {
            (b_index, a_index, true)
        };
        let (head, tail) = self.slots.split_at_mut(high);
        let first = head[low].as_mut()?;
        let second = tail[0].as_mut()?;
        Some(if swapped { (second, first) } else { (first, second) })
    }

    pub fn current_id(&self) -> TaskId {
        *self.ring.front().expect("scheduler ring is empty")
    }

    pub fn current(&self) -> &Task {
        self.task(self.current_id()).expect("current task missing from arena")
    }

    pub fn current_mut(&mut self) -> &mut Task {
        let id = self.current_id();
        self.task_mut(id).expect("current task missing from arena")
    }

    pub fn kernel_task_id(&self) -> TaskId {
        self.kernel_task
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.ring.contains(&id)
    }

    /// Children are derived by walking the ring for tasks whose parent is
    /// `id`; a task that was created but never started is not a child yet.
    pub fn children_of(&self, id: TaskId) -> Vec<TaskId> {
        self.ring
            .iter()
            .copied()
            .filter(|&t| self.task(t).is_some_and(|task| task.parent() == Some(id)))
            .collect()
    }

    /// Append a task to the ring and tell its listeners it is ready.
    pub fn register_task(&mut self, id: TaskId) {
        assert!(self.task(id).is_some(), "registering an unknown task");
        assert!(!self.is_running(id), "task is already registered");
        self.ring.push_back(id);
        self.send_signal(id, Signal::Ready, 0);
    }

    /// Record that `waiter` wants `mask` signals from `target`.
    pub fn wait_on(&mut self, waiter: TaskId, target: TaskId, mask: SignalMask) {
        self.task_mut(waiter)
            .expect("waiter does not exist")
            .upsert_wait(target, mask);
        let target_task = self.task_mut(target).expect("wait target does not exist");
        if !target_task.listening_for.contains(&waiter) {
            target_task.listening_for.push(waiter);
        }
    }

    /// Offer `kind` from `from` to every listener whose waiting entry
    /// covers it. Repeated sends coalesce (last writer wins).
    pub fn send_signal(&mut self, from: TaskId, kind: Signal, value: u32) {
        let Some(from_task) = self.task(from) else {
            return;
        };
        let listeners = from_task.listening_for.clone();
        for listener in listeners {
            if let Some(task) = self.task_mut(listener) {
                task.deliver(from, kind, value);
            }
        }
    }

    fn validate_frame(&self, regs: &Registers) {
        assert!(gdt::selector_is_valid(regs.cs), "bad cs {:#x}", regs.cs);
        assert!(gdt::selector_is_valid(regs.ds as u32), "bad ds {:#x}", regs.ds);
        assert!(gdt::selector_is_valid(regs.es as u32), "bad es {:#x}", regs.es);
        assert!(gdt::selector_is_valid(regs.fs as u32), "bad fs {:#x}", regs.fs);
        assert!(gdt::selector_is_valid(regs.gs as u32), "bad gs {:#x}", regs.gs);
        if self.current().is_user() {
            // An inter-privilege interrupt pushed the user stack segment;
            // only its low 16 bits are architecturally defined.
            assert_eq!(regs.ss as u16, gdt::USER_DATA | gdt::RING3, "bad user ss");
        }
    }

    /// Rotate to the next runnable task or destroy the current one, then
    /// rewrite the trap frame in place with the chosen task's registers.
    pub fn schedule(&mut self, regs: &mut Registers, reason: SwitchReason) {
        if let SwitchReason::Preempt = reason {
            self.validate_frame(regs);
        }

        assert!(!self.ring.is_empty());
        if self.ring.len() == 1 {
            match reason {
                SwitchReason::Preempt => {
                    debug_assert_eq!(self.current_id(), self.kernel_task);
                    return;
                }
                SwitchReason::Terminate(_) => panic!("terminating the main kernel task"),
            }
        }

        // Walk from the slot after the current task, in ring order.
        let chosen_offset = (1..self.ring.len())
            .find(|&i| self.task(self.ring[i]).expect("ring references a dead task").can_run());
        let Some(chosen_offset) = chosen_offset else {
            if self.current_id() == self.kernel_task {
                warn!("deadlock: every task is waiting for a signal that will never arrive");
                return;
            }
            // The kernel task is in the ring and always runnable.
            panic!("no runnable task in the ring");
        };

        match reason {
            SwitchReason::Preempt => {
                self.current_mut().regs = *regs;
                self.ring.rotate_left(chosen_offset);
            }
            SwitchReason::Terminate(exit_value) => {
                let dying = self.ring.pop_front().expect("ring is empty");
                assert_ne!(dying, self.kernel_task, "terminating the main kernel task");
                trace!("destroying task {} with exit value {}", dying, exit_value);
                self.send_signal(dying, Signal::Terminated, exit_value);
                self.destroy_task(dying);
                self.ring.rotate_left(chosen_offset - 1);
            }
        }

        let next_id = self.current_id();
        {
            let next = self.task_mut(next_id).expect("chosen task missing from arena");
            // A task suspended in ProcessWait resumes with the signal kind
            // and value in its result registers.
            if let Some((kind, value, from)) = next.received_signal() {
                next.regs.ebx = kind as u32;
                next.regs.ecx = value;
                next.remove_signal(from);
            }
        }

        gdt::set_kernel_stack(self.task(next_id).expect("chosen task missing from arena").kernel_stack_base());
        self.send_signal(next_id, Signal::Running, 0);

        let next = self.task(next_id).expect("chosen task missing from arena");
        paging::switch_to(next.page_dir());
        *regs = next.regs;
        regs.eflags |= EFLAGS_IF;
    }

    /// Remove a task from the arena and give back everything it owns. The
    /// task object itself parks in the graveyard until the next
    /// destruction; see the field doc.
    fn destroy_task(&mut self, id: TaskId) {
        let index = (id as usize)
            .checked_sub(1)
            .expect("destroying task id zero");
        let mut task = self.slots[index].take().expect("destroying a dead task");

        // Endpoints owned by the task close as if it had called HandleClose.
        channel::close_owned_by(id);

        // Unlink from the listener lists of everything it was waiting on.
        let waited_on: Vec<TaskId> = task.waiting_on.iter().map(|e| e.task).collect();
        for other in waited_on {
            if let Some(other_task) = self.task_mut(other) {
                other_task.listening_for.retain(|&l| l != id);
            }
        }

        task.release_resources();
        // The previous occupant is finally safe to drop: the CPU left its
        // kernel stack when that task's successor was restored.
        if let Some(previous) = self.graveyard.replace(task) {
            drop(previous);
        }
    }
}

/// Create the main kernel task and make it current.
pub fn init() {
    let _guard = InterruptGuard::new();
    let mut scheduler = Scheduler {
        slots: Vec::new(),
        ring: VecDeque::new(),
        kernel_task: 0,
        graveyard: None,
    };
    let task = Task::new(Privilege::Kernel, PageDir::Kernel, None);
    let id = scheduler.insert_task(task);
    scheduler.kernel_task = id;
    scheduler.ring.push_back(id);
    gdt::set_kernel_stack(scheduler.task(id).expect("kernel task vanished").kernel_stack_base());

    let mut global = SCHEDULER.lock();
    assert!(global.is_none(), "scheduler initialized twice");
    *global = Some(scheduler);
    drop(global);

    info!("scheduler initialized, kernel task is {}", id);
}

/// Drop all scheduler state. Anything but the kernel task still in the
/// ring indicates a shutdown bug and is logged.
pub fn teardown() {
    let _guard = InterruptGuard::new();
    let mut global = SCHEDULER.lock();
    if let Some(scheduler) = global.take()
        && scheduler.ring.len() > 1
    {
        warn!("tearing down the scheduler with {} tasks still registered", scheduler.ring.len());
    }
}

pub fn is_initialized() -> bool {
    SCHEDULER.lock().is_some()
}

/// Run `f` against the scheduler. Panics before `init`.
pub fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut global = SCHEDULER.lock();
    f(global.as_mut().expect("scheduler is not initialized"))
}

/// Scheduler entry point for traps.
pub fn schedule(regs: &mut Registers, reason: SwitchReason) {
    let _guard = InterruptGuard::new();
    with(|scheduler| scheduler.schedule(regs, reason));
}

/// Id of the current task, or zero before the scheduler exists.
pub fn current_task_id() -> TaskId {
    SCHEDULER
        .lock()
        .as_ref()
        .map_or(0, |scheduler| scheduler.current_id())
}

/// Whether the current task is a user task. False before init.
pub fn current_is_user() -> bool {
    SCHEDULER
        .lock()
        .as_ref()
        .is_some_and(|scheduler| scheduler.current().is_user())
}

/// Page directory of the current task; the kernel directory before init.
pub fn current_page_dir() -> *mut PageDirectory {
    SCHEDULER
        .lock()
        .as_ref()
        .map_or(paging::kernel_directory(), |scheduler| scheduler.current().page_dir())
}

pub fn main_kernel_task() -> TaskId {
    with(|scheduler| scheduler.kernel_task_id())
}

pub fn is_running(id: TaskId) -> bool {
    with(|scheduler| scheduler.is_running(id))
}
