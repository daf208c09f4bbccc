//! Tasks, processes, signals, and the per-CPU scheduler.
//!
//! A process owns one or more tasks; tasks are what the scheduler runs.
//! Both live in fixed-size slot tables with atomic FREE → RESERVED → USED
//! allocation so slots can be claimed without a table-wide lock.

pub mod context;
pub mod fpu;
pub mod lifecycle;
pub mod process;
pub mod sched;
pub mod signal;
pub mod table;

pub use context::CpuContext;
pub use process::{Process, PROCESS_TABLE};
pub use table::{Task, TaskStatus, TASK_TABLE};

/// Execution level of a task, tracked for accounting and for deciding
/// whether signals may be delivered on a given return path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecLevel {
    /// Running user code.
    User,
    /// Kernel thread, never returns to user space.
    Kthread,
    /// In a system call on behalf of user code.
    Syscall,
    /// In an interrupt handler.
    Irq,
}

/// Task currently running on this CPU, 0 when the scheduler has not
/// dispatched anything yet (early boot, host tests).
pub fn current_task_id() -> u32 {
    sched::current_on(sched::current_cpu())
}
