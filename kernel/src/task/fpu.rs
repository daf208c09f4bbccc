//! Lazy FPU/SSE state switching.
//!
//! The context switch never saves FPU state; it sets CR0.TS instead. The
//! first FPU instruction of the next task traps (#NM), and the trap
//! handler saves the previous owner's state and loads the new owner's.
//! Each CPU carries a "current FPU owner" slot; tasks carry a dirty flag
//! plus the 512-byte FXSAVE area.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::hal::MAX_CPUS;
use crate::task::sched::CpuId;
use crate::task::table::with_task;

/// Task whose state currently sits in each CPU's FPU (0 = none).
static FPU_OWNER: [AtomicU32; MAX_CPUS] = {
    const INIT: AtomicU32 = AtomicU32::new(0);
    [INIT; MAX_CPUS]
};

/// Set CR0.TS so the next FPU instruction traps. Called on every context
/// switch.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn set_trap() {
    unsafe {
        core::arch::asm!(
            "mov rax, cr0",
            "or rax, 8", // CR0.TS
            "mov cr0, rax",
            out("rax") _,
            options(nostack)
        );
    }
}

/// Clear CR0.TS so FPU instructions run natively again.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn clear_trap() {
    unsafe { core::arch::asm!("clts", options(nomem, nostack)) };
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe fn fxsave(area: *mut u8) {
    core::arch::asm!("fxsave [{}]", in(reg) area, options(nostack));
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe fn fxrstor(area: *const u8) {
    core::arch::asm!("fxrstor [{}]", in(reg) area, options(nostack));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn set_trap() {}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn clear_trap() {}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
unsafe fn fxsave(_area: *mut u8) {}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
unsafe fn fxrstor(_area: *const u8) {}

/// Hook for the context-switch path: arm the trap for the incoming task
/// unless its state already owns the FPU.
pub fn on_context_switch(cpu: CpuId, incoming_task: u32) {
    if FPU_OWNER[cpu.0].load(Ordering::Acquire) != incoming_task {
        set_trap();
    }
}

/// Device-not-available (#NM) handler: save the previous owner's state,
/// load the current task's, and hand over ownership.
pub fn handle_nm_trap(cpu: CpuId, current_task: u32) {
    let owner = FPU_OWNER[cpu.0].load(Ordering::Acquire);

    // The trap must be cleared before touching FPU state; a save with TS
    // set would trap again.
    clear_trap();

    if owner == current_task && current_task != 0 {
        return;
    }

    if owner != 0 {
        with_task(owner, |t| {
            unsafe { fxsave(t.fpu_state.data.as_mut_ptr()) };
            t.fpu_dirty = false;
        });
    }

    with_task(current_task, |t| {
        unsafe { fxrstor(t.fpu_state.data.as_ptr()) };
        t.fpu_dirty = true;
    });
    FPU_OWNER[cpu.0].store(current_task, Ordering::Release);
}

/// Forget ownership on task exit so a recycled task id cannot inherit
/// stale FPU state.
pub fn forget_task(task: u32) {
    for owner in FPU_OWNER.iter() {
        let _ = owner.compare_exchange(task, 0, Ordering::AcqRel, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::lifecycle;

    #[test]
    fn ownership_follows_the_trapping_task() {
        let (_p1, a) = lifecycle::spawn_process(5).unwrap();
        let (_p2, b) = lifecycle::spawn_process(5).unwrap();
        let cpu = CpuId(7); // private CPU slot, untouched by other tests

        handle_nm_trap(cpu, a);
        assert_eq!(FPU_OWNER[cpu.0].load(Ordering::Acquire), a);
        assert_eq!(with_task(a, |t| t.fpu_dirty), Some(true));

        // A second trap by the same task is a no-op.
        handle_nm_trap(cpu, a);
        assert_eq!(FPU_OWNER[cpu.0].load(Ordering::Acquire), a);

        // The other task traps: the old owner is saved (dirty cleared).
        handle_nm_trap(cpu, b);
        assert_eq!(FPU_OWNER[cpu.0].load(Ordering::Acquire), b);
        assert_eq!(with_task(a, |t| t.fpu_dirty), Some(false));
        assert_eq!(with_task(b, |t| t.fpu_dirty), Some(true));

        forget_task(b);
        assert_eq!(FPU_OWNER[cpu.0].load(Ordering::Acquire), 0);

        lifecycle::exit(a, 0);
        lifecycle::exit(b, 0);
    }
}
