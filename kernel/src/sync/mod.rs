//! Synchronization primitives: IRQ-safe spinlock and counting semaphore.

pub mod semaphore;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::Spinlock;
