//! Fixed-size slot tables with lock-free allocation, and the task table.
//!
//! A slot moves FREE → RESERVED (atomic claim) → USED (published) → FREE.
//! RESERVED keeps the slot out of every iteration while its owner fills
//! it in, so allocation needs no table-wide lock.

use alloc::vec::Vec;

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::sync::Spinlock;

use super::context::{CpuContext, FxState};
use super::signal::SignalFrame;
use super::ExecLevel;

const SLOT_FREE: u8 = 0;
const SLOT_RESERVED: u8 = 1;
const SLOT_USED: u8 = 2;

/// Generic slot table backing the task and process tables.
pub struct SlotTable<T, const N: usize> {
    states: [AtomicU8; N],
    slots: [Spinlock<Option<T>>; N],
}

impl<T, const N: usize> SlotTable<T, N> {
    pub const fn new() -> Self {
        SlotTable {
            states: [const { AtomicU8::new(SLOT_FREE) }; N],
            slots: [const { Spinlock::new(None) }; N],
        }
    }

    /// Claim a free slot, transitioning it to RESERVED. The caller must
    /// publish or abandon it.
    pub fn reserve(&self) -> Option<usize> {
        for (i, state) in self.states.iter().enumerate() {
            if state
                .compare_exchange(SLOT_FREE, SLOT_RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    /// Publish a reserved slot, making it visible to iteration.
    pub fn publish(&self, idx: usize, value: T) {
        debug_assert_eq!(self.states[idx].load(Ordering::Acquire), SLOT_RESERVED);
        *self.slots[idx].lock() = Some(value);
        self.states[idx].store(SLOT_USED, Ordering::Release);
    }

    /// Return a reserved slot unused (allocation failed mid-way).
    pub fn abandon(&self, idx: usize) {
        debug_assert_eq!(self.states[idx].load(Ordering::Acquire), SLOT_RESERVED);
        self.states[idx].store(SLOT_FREE, Ordering::Release);
    }

    /// Free a used slot.
    pub fn release(&self, idx: usize) {
        *self.slots[idx].lock() = None;
        self.states[idx].store(SLOT_FREE, Ordering::Release);
    }

    /// Run `f` on the slot's value if it is published.
    pub fn with<R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if idx >= N || self.states[idx].load(Ordering::Acquire) != SLOT_USED {
            return None;
        }
        let mut slot = self.slots[idx].lock();
        slot.as_mut().map(f)
    }

    /// Indices of every published slot.
    pub fn used_slots(&self) -> Vec<usize> {
        (0..N)
            .filter(|&i| self.states[i].load(Ordering::Acquire) == SLOT_USED)
            .collect()
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet dispatched for the first time.
    New,
    /// Runnable or running.
    Running,
    /// Blocked, not interruptible by signals.
    Blocked,
    /// Blocked, a signal wakes it with EINTR.
    BlockedIntr,
    /// Stopped by a stop signal until SIGCONT.
    Stopped,
    /// Finished; waiting to be reaped.
    Done,
}

/// One schedulable task.
#[derive(Debug)]
pub struct Task {
    pub id: u32,
    /// Owning process (pid).
    pub process: u32,
    pub status: TaskStatus,
    pub priority: u8,
    pub context: CpuContext,
    pub fpu_state: FxState,
    /// Set when the FPU has been used since the last save.
    pub fpu_dirty: bool,
    pub sig_pending: u32,
    pub sig_blocked: u32,
    /// Signals a sigwait-style caller is waiting for.
    pub sig_waiting: u32,
    /// CPU affinity bitmask; bit n allows CPU n.
    pub affinity: u8,
    pub exec_level: ExecLevel,
    /// Process is exiting; the task must unwind at the next edge.
    pub force_exit: bool,
    /// A signal interrupted this task's blocking wait.
    pub interrupted: bool,
    pub exit_status: u32,
    /// Pushed signal frames, innermost last.
    pub frames: Vec<SignalFrame>,
    /// Timer ticks consumed while running.
    pub cpu_ticks: u64,
}

impl Task {
    pub fn new(id: u32, process: u32, priority: u8) -> Task {
        Task {
            id,
            process,
            status: TaskStatus::New,
            priority,
            context: CpuContext::default(),
            fpu_state: FxState::new_default(),
            fpu_dirty: false,
            sig_pending: 0,
            sig_blocked: 0,
            sig_waiting: 0,
            affinity: 0xFF,
            exec_level: ExecLevel::Kthread,
            force_exit: false,
            interrupted: false,
            exit_status: 0,
            frames: Vec::new(),
            cpu_ticks: 0,
        }
    }
}

/// Size of the task table.
pub const MAX_TASKS: usize = 128;

/// The global task table. Task id = slot index + 1 (0 is "no task").
pub static TASK_TABLE: SlotTable<Task, MAX_TASKS> = SlotTable::new();

static NEXT_TASK_SEQ: AtomicU32 = AtomicU32::new(1);

/// Allocate and publish a task. Returns the task id.
pub fn alloc_task(process: u32, priority: u8) -> Option<u32> {
    let idx = TASK_TABLE.reserve()?;
    let id = idx as u32 + 1;
    let _seq = NEXT_TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    TASK_TABLE.publish(idx, Task::new(id, process, priority));
    Some(id)
}

/// Run `f` on a task by id.
pub fn with_task<R>(id: u32, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    if id == 0 {
        return None;
    }
    TASK_TABLE.with(id as usize - 1, f)
}

/// Free a task slot.
pub fn free_task(id: u32) {
    if id != 0 {
        TASK_TABLE.release(id as usize - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reserved_slots_are_not_visible() {
        let table: SlotTable<u32, 4> = SlotTable::new();
        let idx = table.reserve().unwrap();
        assert!(table.used_slots().is_empty());
        assert!(table.with(idx, |_| ()).is_none());
        table.publish(idx, 7);
        assert_eq!(table.used_slots(), std::vec![idx]);
        assert_eq!(table.with(idx, |v| *v), Some(7));
        table.release(idx);
        assert!(table.used_slots().is_empty());
    }

    #[test]
    fn allocation_is_race_free() {
        let table: Arc<SlotTable<u32, 64>> = Arc::new(SlotTable::new());
        let mut handles = std::vec::Vec::new();
        for t in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut mine = std::vec::Vec::new();
                for _ in 0..8 {
                    let idx = table.reserve().unwrap();
                    table.publish(idx, t);
                    mine.push(idx);
                }
                mine
            }));
        }
        let mut all: std::vec::Vec<usize> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64, "every claimed slot must be unique");
    }

    #[test]
    fn exhaustion_returns_none() {
        let table: SlotTable<u8, 2> = SlotTable::new();
        let a = table.reserve().unwrap();
        let _b = table.reserve().unwrap();
        assert!(table.reserve().is_none());
        table.abandon(a);
        assert!(table.reserve().is_some());
    }
}
