//! Signal numbers, default actions, masks, and signal frames.
//!
//! Delivery is observable only at execution-level transitions back toward
//! user mode: the return-to-user path calls [`deliver_pending`], which
//! either performs the default action or pushes a signal frame redirecting
//! the task's saved context into the handler; `sigreturn` pops it.

use crate::task::context::{CpuContext, FxState};
use crate::task::table::{with_task, TaskStatus};
use crate::task::{process, sched, ExecLevel};

/// Number of signals (1..=31 usable).
pub const NSIG: usize = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGWINCH: u32 = 28;

/// Handler value: default action.
pub const SIG_DFL: u64 = 0;
/// Handler value: ignore.
pub const SIG_IGN: u64 = 1;

/// Mask bit for a signal number.
pub const fn sig_bit(sig: u32) -> u32 {
    1 << (sig - 1)
}

/// SIGKILL and SIGSTOP can be neither blocked nor handled.
pub const UNMASKABLE: u32 = sig_bit(SIGKILL) | sig_bit(SIGSTOP);

/// Per-signal disposition in the process's action vector.
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: u64,
    /// Signals additionally blocked while the handler runs.
    pub mask: u32,
    pub flags: u32,
}

impl Default for SigAction {
    fn default() -> Self {
        SigAction { handler: SIG_DFL, mask: 0, flags: 0 }
    }
}

/// What SIG_DFL means for each signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// The fixed default-action table.
pub fn default_action(sig: u32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

/// Everything needed to resume after a handler returns: the interrupted
/// context, the FPU area, the mask in effect, and the kernel stack
/// pointer at delivery time.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub context: CpuContext,
    pub fpu: FxState,
    pub mask: u32,
    pub kernel_rsp: u64,
}

/// Outcome of a delivery pass, handed to the arch return path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing deliverable.
    None,
    /// A frame was pushed; resume into the handler.
    Handled(u32),
    /// The default action terminated the process.
    Terminated(u32),
    /// The task stopped.
    Stopped(u32),
    /// A stopped task resumed.
    Continued,
}

/// Post `sig` to a task. A task sleeping interruptibly is woken and its
/// blocking call returns EINTR.
pub fn send_to_task(task_id: u32, sig: u32) -> bool {
    if sig == 0 || sig as usize >= NSIG {
        return false;
    }
    let wake = with_task(task_id, |t| {
        t.sig_pending |= sig_bit(sig);
        let deliverable = sig_bit(sig) & (!t.sig_blocked | UNMASKABLE) != 0;
        if t.status == TaskStatus::BlockedIntr && deliverable {
            t.status = TaskStatus::Running;
            t.interrupted = true;
            return Some((t.priority, t.affinity));
        }
        if sig == SIGCONT && t.status == TaskStatus::Stopped {
            t.status = TaskStatus::Running;
            return Some((t.priority, t.affinity));
        }
        None
    });
    match wake {
        None => false,
        Some(None) => true,
        Some(Some((priority, affinity))) => {
            sched::enqueue_global(task_id, priority, affinity);
            true
        }
    }
}

/// Post `sig` to a process: the first task that does not block it takes
/// delivery, falling back to the first task.
pub fn send_to_process(pid: u32, sig: u32) -> bool {
    let tasks = super::lifecycle::tasks_of(pid);
    if tasks.is_empty() {
        return false;
    }
    let preferred = tasks
        .iter()
        .copied()
        .find(|&id| {
            with_task(id, |t| sig_bit(sig) & (!t.sig_blocked | UNMASKABLE) != 0) == Some(true)
        })
        .unwrap_or(tasks[0]);
    let sent = send_to_task(preferred, sig);
    // A parent blocked in waitpid must notice SIGCHLD-class wakeups.
    process::with_process(pid, |p| p.child_event.signal());
    sent
}

/// Replace the blocked mask; SIGKILL/SIGSTOP stay unmaskable. Returns the
/// previous mask.
pub fn set_blocked(task_id: u32, mask: u32) -> Option<u32> {
    with_task(task_id, |t| {
        let old = t.sig_blocked;
        t.sig_blocked = mask & !UNMASKABLE;
        old
    })
}

/// Deliver pending, unblocked signals on the return-to-user edge.
///
/// Kernel threads never take signal delivery. Ignored signals (explicitly
/// or by default) are consumed silently; the first signal with an effect
/// decides the outcome.
pub fn deliver_pending(task_id: u32) -> Delivery {
    loop {
        let step = with_task(task_id, |t| {
            if t.exec_level == ExecLevel::Kthread {
                return Step::Done(Delivery::None);
            }
            let deliverable = t.sig_pending & (!t.sig_blocked | UNMASKABLE);
            if deliverable == 0 {
                return Step::Done(Delivery::None);
            }
            let sig = deliverable.trailing_zeros() + 1;
            t.sig_pending &= !sig_bit(sig);
            Step::Decide(sig, t.process)
        });

        let (sig, pid) = match step {
            None => return Delivery::None,
            Some(Step::Done(d)) => return d,
            Some(Step::Decide(sig, pid)) => (sig, pid),
        };

        let action = process::with_process(pid, |p| p.sigactions[sig as usize])
            .unwrap_or_default();

        // SIGKILL and SIGSTOP cannot be caught or ignored.
        let handler = if sig == SIGKILL || sig == SIGSTOP { SIG_DFL } else { action.handler };

        match handler {
            SIG_IGN => continue,
            SIG_DFL => match default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Continue => {
                    with_task(task_id, |t| {
                        if t.status == TaskStatus::Stopped {
                            t.status = TaskStatus::Running;
                        }
                    });
                    return Delivery::Continued;
                }
                DefaultAction::Stop => {
                    with_task(task_id, |t| t.status = TaskStatus::Stopped);
                    return Delivery::Stopped(sig);
                }
                DefaultAction::Terminate => {
                    super::lifecycle::exit(task_id, 128 + sig);
                    return Delivery::Terminated(sig);
                }
            },
            handler_addr => {
                with_task(task_id, |t| {
                    t.frames.push(SignalFrame {
                        context: t.context,
                        fpu: t.fpu_state.clone(),
                        mask: t.sig_blocked,
                        kernel_rsp: t.context.rsp,
                    });
                    t.sig_blocked |= (action.mask | sig_bit(sig)) & !UNMASKABLE;
                    t.context.rip = handler_addr;
                    t.context.rdi = sig as u64;
                });
                return Delivery::Handled(sig);
            }
        }
    }
}

enum Step {
    Done(Delivery),
    Decide(u32, u32),
}

/// Wait until one of the signals in `mask` is pending, consume it, and
/// return its number. The sleep is interruptible: delivery of a signal
/// outside `mask` breaks the wait with `EINTR`.
pub fn sigwait(task_id: u32, mask: u32) -> Result<u32, crate::error::Errno> {
    if mask == 0 {
        return Err(crate::error::Errno::Inval);
    }
    loop {
        let step = with_task(task_id, |t| {
            let hit = t.sig_pending & mask;
            if hit != 0 {
                let sig = hit.trailing_zeros() + 1;
                t.sig_pending &= !sig_bit(sig);
                t.sig_waiting = 0;
                t.status = TaskStatus::Running;
                return Some(Ok(sig));
            }
            if t.interrupted {
                t.interrupted = false;
                t.sig_waiting = 0;
                t.status = TaskStatus::Running;
                return Some(Err(crate::error::Errno::Intr));
            }
            t.sig_waiting = mask;
            t.status = TaskStatus::BlockedIntr;
            None
        });
        match step {
            None => return Err(crate::error::Errno::Srch),
            Some(Some(result)) => return result,
            Some(None) => core::hint::spin_loop(),
        }
    }
}

/// Pop the innermost signal frame, restoring context, FPU state, and the
/// signal mask saved at delivery.
pub fn sigreturn(task_id: u32) -> Result<(), crate::error::Errno> {
    let ok = with_task(task_id, |t| match t.frames.pop() {
        Some(frame) => {
            t.context = frame.context;
            t.fpu_state = frame.fpu;
            t.sig_blocked = frame.mask;
            true
        }
        None => false,
    });
    match ok {
        Some(true) => Ok(()),
        _ => Err(crate::error::Errno::Inval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::lifecycle;

    fn spawn_user_task() -> (u32, u32) {
        let (pid, task) = lifecycle::spawn_process(5).unwrap();
        with_task(task, |t| t.exec_level = ExecLevel::Syscall);
        (pid, task)
    }

    #[test]
    fn default_table_matches_the_classic_dispositions() {
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(SIGSEGV), DefaultAction::Terminate);
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
    }

    #[test]
    fn blocked_signals_stay_pending() {
        let (_pid, task) = spawn_user_task();
        set_blocked(task, sig_bit(SIGUSR1)).unwrap();
        send_to_task(task, SIGUSR1);
        assert_eq!(deliver_pending(task), Delivery::None);

        // Unblocking makes it deliverable; default action terminates.
        set_blocked(task, 0).unwrap();
        assert_eq!(deliver_pending(task), Delivery::Terminated(SIGUSR1));
    }

    #[test]
    fn kill_and_stop_cannot_be_masked() {
        let (_pid, task) = spawn_user_task();
        set_blocked(task, 0xFFFF_FFFF).unwrap();
        let blocked = with_task(task, |t| t.sig_blocked).unwrap();
        assert_eq!(blocked & UNMASKABLE, 0);

        send_to_task(task, SIGKILL);
        assert_eq!(deliver_pending(task), Delivery::Terminated(SIGKILL));
    }

    #[test]
    fn handler_frame_push_and_sigreturn() {
        let (pid, task) = spawn_user_task();
        process::with_process(pid, |p| {
            p.sigactions[SIGUSR1 as usize] =
                SigAction { handler: 0xDEAD_F00D, mask: sig_bit(SIGUSR2), flags: 0 };
        });
        with_task(task, |t| {
            t.context.rip = 0x4000_1000;
            t.context.rsp = 0x7FFF_0000;
        });

        send_to_task(task, SIGUSR1);
        assert_eq!(deliver_pending(task), Delivery::Handled(SIGUSR1));

        with_task(task, |t| {
            assert_eq!(t.context.rip, 0xDEAD_F00D);
            assert_eq!(t.context.rdi, SIGUSR1 as u64);
            // Handler mask plus the signal itself are blocked.
            assert_ne!(t.sig_blocked & sig_bit(SIGUSR1), 0);
            assert_ne!(t.sig_blocked & sig_bit(SIGUSR2), 0);
            assert_eq!(t.frames.len(), 1);
        });

        sigreturn(task).unwrap();
        with_task(task, |t| {
            assert_eq!(t.context.rip, 0x4000_1000);
            assert_eq!(t.sig_blocked, 0);
            assert!(t.frames.is_empty());
        });

        // A stray sigreturn with no frame is rejected.
        assert!(sigreturn(task).is_err());
        lifecycle::exit(task, 0);
    }

    #[test]
    fn stop_and_continue_toggle_the_task() {
        let (_pid, task) = spawn_user_task();
        send_to_task(task, SIGTSTP);
        assert_eq!(deliver_pending(task), Delivery::Stopped(SIGTSTP));
        assert_eq!(with_task(task, |t| t.status).unwrap(), TaskStatus::Stopped);

        send_to_task(task, SIGCONT);
        assert_eq!(with_task(task, |t| t.status).unwrap(), TaskStatus::Running);
        assert_eq!(deliver_pending(task), Delivery::Continued);
        lifecycle::exit(task, 0);
    }

    #[test]
    fn sigwait_consumes_a_pending_signal() {
        let (_pid, task) = spawn_user_task();
        send_to_task(task, SIGUSR2);
        assert_eq!(sigwait(task, sig_bit(SIGUSR2)), Ok(SIGUSR2));
        assert_eq!(with_task(task, |t| t.sig_pending).unwrap(), 0);

        // A waiter parked on one signal is broken out by another.
        with_task(task, |t| t.status = TaskStatus::BlockedIntr);
        let waiter = std::thread::spawn(move || sigwait(task, sig_bit(SIGUSR2)));
        std::thread::sleep(std::time::Duration::from_millis(10));
        send_to_task(task, SIGTERM);
        assert_eq!(waiter.join().unwrap(), Err(crate::error::Errno::Intr));
        lifecycle::exit(task, 0);
    }

    #[test]
    fn interruptible_sleep_is_woken() {
        let (_pid, task) = spawn_user_task();
        with_task(task, |t| t.status = TaskStatus::BlockedIntr);
        send_to_task(task, SIGTERM);
        with_task(task, |t| {
            assert_eq!(t.status, TaskStatus::Running);
            assert!(t.interrupted);
        });
        // An uninterruptible sleep is left alone.
        with_task(task, |t| {
            t.interrupted = false;
            t.status = TaskStatus::Blocked;
            t.sig_pending = 0;
        });
        send_to_task(task, SIGTERM);
        with_task(task, |t| {
            assert_eq!(t.status, TaskStatus::Blocked);
            assert!(!t.interrupted);
        });
        with_task(task, |t| t.status = TaskStatus::Running);
        lifecycle::exit(task, 0);
    }
}
