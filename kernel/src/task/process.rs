//! Process table and per-process state.

use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::mem::AddressSpace;
use crate::sync::Semaphore;

use super::signal::{SigAction, NSIG};
use super::table::SlotTable;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Has live tasks.
    Active,
    /// Every task is DONE; waiting for the parent to reap it.
    Waitable,
}

/// Accumulated CPU times in ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcTimes {
    pub user: u64,
    pub system: u64,
    pub child_user: u64,
    pub child_system: u64,
}

/// Per-file-descriptor state. The backing object is referenced by a
/// handle the VFS layer hands out; this table tracks inheritance and
/// close-on-exec only.
#[derive(Debug, Clone, Copy)]
pub struct FileDesc {
    pub handle: u32,
    pub close_on_exec: bool,
}

/// One process: a slot in the fixed process table.
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub session: u32,
    pub pgid: u32,
    /// real, effective, saved.
    pub uids: [u16; 3],
    pub gids: [u16; 3],
    pub state: ProcessState,
    pub address_space: Option<AddressSpace>,
    pub sigactions: [SigAction; NSIG],
    pub times: ProcTimes,
    /// Controlling terminal (0 = none).
    pub cterm: u32,
    pub task_count: u32,
    pub exit_status: u32,
    pub fds: Vec<Option<FileDesc>>,
    /// Signaled whenever a child becomes waitable (or a signal should
    /// interrupt a waiting parent).
    pub child_event: Semaphore,
}

impl Process {
    pub fn new(pid: u32, ppid: u32) -> Process {
        Process {
            pid,
            ppid,
            session: pid,
            pgid: pid,
            uids: [0; 3],
            gids: [0; 3],
            state: ProcessState::Active,
            address_space: None,
            sigactions: [SigAction::default(); NSIG],
            times: ProcTimes::default(),
            cterm: 0,
            task_count: 0,
            exit_status: 0,
            fds: Vec::new(),
            child_event: Semaphore::new(0),
        }
    }
}

/// Size of the process table.
pub const MAX_PROCESSES: usize = 64;

pub static PROCESS_TABLE: SlotTable<Process, MAX_PROCESSES> = SlotTable::new();

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub fn next_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Slot index of a pid (for release).
pub fn slot_of(pid: u32) -> Option<usize> {
    PROCESS_TABLE
        .used_slots()
        .into_iter()
        .find(|&idx| PROCESS_TABLE.with(idx, |p| p.pid == pid) == Some(true))
}

/// Run `f` on the process with the given pid.
pub fn with_process<R>(pid: u32, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let idx = slot_of(pid)?;
    PROCESS_TABLE.with(idx, f)
}
