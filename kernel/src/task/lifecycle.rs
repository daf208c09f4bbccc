//! Process lifecycle: spawn, fork, exec, exit, waitpid.

use alloc::vec::Vec;

use crate::error::Errno;
use crate::mem;
use crate::task::context::FxState;
use crate::task::process::{
    next_pid, slot_of, with_process, Process, ProcessState, PROCESS_TABLE,
};
use crate::task::signal::{self, SIGCHLD, SIG_IGN};
use crate::task::table::{alloc_task, free_task, with_task, TaskStatus, TASK_TABLE};
use crate::task::{sched, ExecLevel};

/// Tasks belonging to a process.
pub fn tasks_of(pid: u32) -> Vec<u32> {
    TASK_TABLE
        .used_slots()
        .into_iter()
        .filter_map(|idx| {
            TASK_TABLE.with(idx, |t| if t.process == pid { Some(t.id) } else { None })?
        })
        .collect()
}

/// Create a fresh process with a single task (boot-time init and kernel
/// threads; also the root of every fork tree in the tests).
pub fn spawn_process(priority: u8) -> Result<(u32, u32), Errno> {
    let slot = PROCESS_TABLE.reserve().ok_or(Errno::Again)?;
    let pid = next_pid();
    let task = match alloc_task(pid, priority) {
        Some(t) => t,
        None => {
            PROCESS_TABLE.abandon(slot);
            return Err(Errno::Again);
        }
    };
    let mut proc = Process::new(pid, 0);
    proc.task_count = 1;
    PROCESS_TABLE.publish(slot, proc);
    with_task(task, |t| t.status = TaskStatus::Running);
    Ok((pid, task))
}

/// Fork the process owning `parent_task`. The child gets a copy-on-write
/// address space, a single task cloning the parent task's saved user
/// context (with a zero return value), and inherits fds, session/pgid,
/// and signal actions. Returns the child pid.
pub fn fork(parent_task: u32) -> Result<u32, Errno> {
    let (parent_pid, context, priority, affinity, sig_blocked, exec_level) =
        with_task(parent_task, |t| {
            (t.process, t.context, t.priority, t.affinity, t.sig_blocked, t.exec_level)
        })
        .ok_or(Errno::Srch)?;

    struct Inherited {
        session: u32,
        pgid: u32,
        uids: [u16; 3],
        gids: [u16; 3],
        sigactions: [signal::SigAction; signal::NSIG],
        cterm: u32,
        fds: Vec<Option<crate::task::process::FileDesc>>,
        address_space: Option<mem::AddressSpace>,
    }
    let inherited = with_process(parent_pid, |p| Inherited {
        session: p.session,
        pgid: p.pgid,
        uids: p.uids,
        gids: p.gids,
        sigactions: p.sigactions,
        cterm: p.cterm,
        fds: p.fds.clone(),
        address_space: p.address_space,
    })
    .ok_or(Errno::Srch)?;

    let child_as = match inherited.address_space {
        Some(space) => Some(mem::clone_address_space(space).ok_or(Errno::NoMem)?),
        None => None,
    };

    let slot = match PROCESS_TABLE.reserve() {
        Some(s) => s,
        None => {
            if let Some(space) = child_as {
                mem::free_address_space(space);
            }
            return Err(Errno::Again);
        }
    };
    let child_pid = next_pid();
    let child_task = match alloc_task(child_pid, priority) {
        Some(t) => t,
        None => {
            PROCESS_TABLE.abandon(slot);
            if let Some(space) = child_as {
                mem::free_address_space(space);
            }
            return Err(Errno::Again);
        }
    };

    let mut child = Process::new(child_pid, parent_pid);
    child.session = inherited.session;
    child.pgid = inherited.pgid;
    child.uids = inherited.uids;
    child.gids = inherited.gids;
    child.sigactions = inherited.sigactions;
    child.cterm = inherited.cterm;
    child.fds = inherited.fds;
    child.address_space = child_as;
    child.task_count = 1;
    PROCESS_TABLE.publish(slot, child);

    with_task(child_task, |t| {
        t.context = context;
        t.context.rax = 0; // the child observes fork() == 0
        t.sig_blocked = sig_blocked;
        t.exec_level = exec_level;
        t.affinity = affinity;
        t.status = TaskStatus::New;
    });

    sched::enqueue_global(child_task, priority, affinity);
    log::debug!(target: "pm", "fork: {} -> {} (task {})", parent_pid, child_pid, child_task);
    Ok(child_pid)
}

/// A loaded binary, as handed over by the program loader: entry point and
/// the prepared user stack (argv/envp already laid out).
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage {
    pub entry: u64,
    pub stack_top: u64,
}

/// Replace the calling task's program. Validation failures before the
/// point of no return leave the old image intact; after it, the task can
/// only run the new image.
pub fn exec(task_id: u32, image: ProgramImage) -> Result<(), Errno> {
    if image.entry == 0 || image.stack_top == 0 {
        return Err(Errno::Inval);
    }
    let pid = with_task(task_id, |t| t.process).ok_or(Errno::Srch)?;

    let new_space = mem::new_address_space().ok_or(Errno::NoMem)?;

    // Point of no return: install the new address space and drop the old.
    let old_space = with_process(pid, |p| {
        let old = p.address_space.replace(new_space);
        // Handlers reset to default; explicitly ignored signals survive.
        for action in p.sigactions.iter_mut() {
            if action.handler != SIG_IGN {
                *action = signal::SigAction::default();
            }
        }
        for fd in p.fds.iter_mut() {
            if fd.is_some_and(|f| f.close_on_exec) {
                *fd = None;
            }
        }
        old
    })
    .ok_or(Errno::Srch)?;
    if let Some(space) = old_space {
        mem::free_address_space(space);
    }

    with_task(task_id, |t| {
        t.context = crate::task::CpuContext {
            rip: image.entry,
            rsp: image.stack_top,
            rflags: 0x202,
            ..Default::default()
        };
        t.frames.clear();
        t.fpu_state = FxState::new_default();
        t.fpu_dirty = false;
        t.exec_level = ExecLevel::Syscall;
    });
    Ok(())
}

/// Terminate the process owning `task_id`.
///
/// Every sibling task is marked force-exit; the last task to go through
/// here flips the process to waitable, records the exit status, raises
/// SIGCHLD at the parent, and wakes any waiter.
pub fn exit(task_id: u32, status: u32) {
    let pid = match with_task(task_id, |t| t.process) {
        Some(p) => p,
        None => return,
    };

    for sibling in tasks_of(pid) {
        if sibling != task_id {
            with_task(sibling, |t| t.force_exit = true);
        }
    }
    with_task(task_id, |t| {
        t.status = TaskStatus::Done;
        t.exit_status = status;
    });

    let all_done = tasks_of(pid)
        .iter()
        .all(|&id| with_task(id, |t| t.status == TaskStatus::Done) == Some(true));
    if !all_done {
        return;
    }

    let (ppid, space) = match with_process(pid, |p| {
        p.state = ProcessState::Waitable;
        p.exit_status = status;
        (p.ppid, p.address_space.take())
    }) {
        Some(v) => v,
        None => return,
    };
    if let Some(space) = space {
        mem::free_address_space(space);
    }

    log::debug!(target: "pm", "exit: pid {} status {}", pid, status);
    if ppid != 0 {
        signal::send_to_process(ppid, SIGCHLD);
        with_process(ppid, |p| p.child_event.signal());
    }
}

/// Wait for a child to become waitable and reap it.
///
/// `which` = None waits for any child; Some(pid) for that child. Returns
/// `(pid, exit_status)`. `ECHILD` with no matching children, `EINTR` when
/// a signal interrupts the sleep.
pub fn waitpid(caller_task: u32, which: Option<u32>) -> Result<(u32, u32), Errno> {
    let me = with_task(caller_task, |t| t.process).ok_or(Errno::Srch)?;

    loop {
        let mut have_child = false;
        let mut ready: Option<u32> = None;
        for idx in PROCESS_TABLE.used_slots() {
            let probe = PROCESS_TABLE.with(idx, |p| (p.pid, p.ppid, p.state));
            if let Some((pid, ppid, state)) = probe {
                if ppid != me {
                    continue;
                }
                if let Some(want) = which {
                    if pid != want {
                        continue;
                    }
                }
                have_child = true;
                if state == ProcessState::Waitable {
                    ready = Some(pid);
                    break;
                }
            }
        }

        if let Some(child_pid) = ready {
            return Ok(reap(me, child_pid));
        }
        if !have_child {
            return Err(Errno::Child);
        }

        // Sleep interruptibly until a child event or a signal.
        let interrupted = with_task(caller_task, |t| {
            if t.interrupted {
                t.interrupted = false;
                t.status = TaskStatus::Running;
                return true;
            }
            t.status = TaskStatus::BlockedIntr;
            false
        })
        .ok_or(Errno::Srch)?;
        if interrupted {
            return Err(Errno::Intr);
        }

        let woke = with_process(me, |p| p.child_event.try_wait()).unwrap_or(false);
        if !woke {
            core::hint::spin_loop();
        }
        with_task(caller_task, |t| {
            if t.status == TaskStatus::BlockedIntr {
                t.status = TaskStatus::Running;
            }
        });
    }
}

/// Release a waitable child: free its task slots and process slot and
/// fold its CPU times into the parent's children counters.
fn reap(parent_pid: u32, child_pid: u32) -> (u32, u32) {
    let mut ticks = 0u64;
    for id in tasks_of(child_pid) {
        ticks += with_task(id, |t| t.cpu_ticks).unwrap_or(0);
        free_task(id);
    }
    let (status, child_times) = with_process(child_pid, |p| (p.exit_status, p.times))
        .unwrap_or((0, Default::default()));
    with_process(parent_pid, |p| {
        p.times.child_user += child_times.user + child_times.child_user + ticks;
        p.times.child_system += child_times.system + child_times.child_system;
    });
    if let Some(slot) = slot_of(child_pid) {
        PROCESS_TABLE.release(slot);
    }
    (child_pid, status)
}
