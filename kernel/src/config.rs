//! Recognized kernel parameters.
//!
//! The boot code parses the command line (out of scope here) and publishes
//! each recognized parameter via [`set`]. All values are integers; unknown
//! names are ignored so that parameter parsing stays forward compatible.

use core::sync::atomic::{AtomicU32, Ordering};

/// `pata_ro=1`: the PATA driver refuses writes and panics on any attempt.
static PATA_RO: AtomicU32 = AtomicU32::new(0);
/// `ahci_ro=1`: the AHCI driver refuses writes and panics on any attempt.
static AHCI_RO: AtomicU32 = AtomicU32::new(0);
/// `tcp_disable_cc=1`: congestion control off, cwnd pinned to the maximum.
static TCP_DISABLE_CC: AtomicU32 = AtomicU32::new(0);
/// `sched_ipi=1`: cross-CPU enqueues send a reschedule IPI.
static SCHED_IPI: AtomicU32 = AtomicU32::new(0);
/// `root=<(major << 8) | minor>`: device holding the root filesystem.
static ROOT_DEV: AtomicU32 = AtomicU32::new(0);

/// Publish a parameter value. Unknown names are ignored.
pub fn set(name: &str, value: u32) {
    match name {
        "pata_ro" => PATA_RO.store(value, Ordering::Relaxed),
        "ahci_ro" => AHCI_RO.store(value, Ordering::Relaxed),
        "tcp_disable_cc" => TCP_DISABLE_CC.store(value, Ordering::Relaxed),
        "sched_ipi" => SCHED_IPI.store(value, Ordering::Relaxed),
        "root" => ROOT_DEV.store(value, Ordering::Relaxed),
        _ => log::debug!(target: "config", "ignoring unknown parameter {}={}", name, value),
    }
}

pub fn pata_ro() -> bool {
    PATA_RO.load(Ordering::Relaxed) != 0
}

pub fn ahci_ro() -> bool {
    AHCI_RO.load(Ordering::Relaxed) != 0
}

pub fn tcp_disable_cc() -> bool {
    TCP_DISABLE_CC.load(Ordering::Relaxed) != 0
}

pub fn sched_ipi() -> bool {
    SCHED_IPI.load(Ordering::Relaxed) != 0
}

/// Root device as `(major, minor)`.
pub fn root_dev() -> (u8, u8) {
    let v = ROOT_DEV.load(Ordering::Relaxed);
    (((v >> 8) & 0xFF) as u8, (v & 0xFF) as u8)
}
