//! Hardware abstraction layer: the small set of CPU operations the
//! portable kernel code needs. `cfg`-gated so the same crate builds for
//! the freestanding kernel target and for the host test harness (where
//! interrupt-flag manipulation is a no-op).

/// Maximum number of CPUs supported by the kernel.
pub const MAX_CPUS: usize = 8;

/// Enable interrupts on the current CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Disable interrupts on the current CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Check whether interrupts are enabled on the current CPU (RFLAGS.IF).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn interrupts_enabled() -> bool {
    let flags: u64;
    unsafe {
        core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & 0x200 != 0
}

/// Halt the CPU until the next interrupt.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn halt() {
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
pub fn enable_interrupts() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
pub fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
pub fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
pub fn halt() {
    core::hint::spin_loop();
}
