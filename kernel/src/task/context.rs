//! Saved CPU context for context switching (x86-64).
//!
//! The layout is what the assembly context-switch routine (out of scope
//! here) saves and restores; the process manager treats it as plain data:
//! fork copies it, exec rewrites it, signal delivery redirects it.

/// Register state saved across a context switch.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr3: u64,
}

/// Saved FPU/SSE state in FXSAVE format (512 bytes, 16-byte aligned).
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxState {
    pub data: [u8; 512],
}

impl FxState {
    /// Default state: all x87 and SSE exceptions masked.
    pub fn new_default() -> Self {
        let mut s = FxState { data: [0u8; 512] };
        // FCW at offset 0: 0x037F.
        s.data[0] = 0x7F;
        s.data[1] = 0x03;
        // MXCSR at offset 24: 0x1F80.
        s.data[24] = 0x80;
        s.data[25] = 0x1F;
        s
    }
}

impl Default for FxState {
    fn default() -> Self {
        Self::new_default()
    }
}

impl core::fmt::Debug for FxState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FxState {{ .. }}")
    }
}
