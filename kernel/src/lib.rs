//! Kestrel kernel core.
//!
//! The hard parts of a small x86 kernel: the process/task manager with a
//! preemptive multi-CPU scheduler, the PATA/AHCI block layer with its
//! shared request queue and DMA, the EXT2 filesystem, and the TCP/IP
//! stack (ARP + TCP). Boot, console, PCI enumeration, interrupt
//! controller programming, and the page-table machinery live in the
//! kernel binary; this crate consumes their interfaces (`mem`, `config`,
//! `time::tick`, IRQ dispatch into the drivers).
//!
//! Builds freestanding for the kernel image and against std for the host
//! test suite; hardware touching code is confined to `arch` and the
//! driver submit/IRQ paths.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod mem;
pub mod net;
pub mod sync;
pub mod task;
pub mod time;
