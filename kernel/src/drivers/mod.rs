//! Device drivers: PCI configuration access, the block-device registry,
//! and the storage drivers with their shared request queue.

pub mod blockdev;
pub mod pci;
pub mod storage;
