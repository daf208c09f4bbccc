//! Architecture support: interrupt-flag control and x86 port I/O.
//! Everything above this layer is architecture-agnostic.

pub mod hal;
pub mod x86;
