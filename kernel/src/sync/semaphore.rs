//! Counting semaphore for resource-count-based synchronization.
//!
//! Gates request-queue slots (Q permits per device), signals per-request
//! completion from IRQ context, and serializes on-disk filesystem metadata
//! (binary form). Waiters spin-poll with a pause hint; interrupt handlers
//! only ever call [`Semaphore::signal`], which never blocks.

use crate::sync::spinlock::Spinlock;

/// Counting semaphore.
pub struct Semaphore {
    count: Spinlock<i32>,
}

impl Semaphore {
    /// Create a new semaphore with the given initial count.
    pub const fn new(initial: i32) -> Self {
        Semaphore { count: Spinlock::new(initial) }
    }

    /// Decrement (P operation). Spins while the count is zero.
    pub fn wait(&self) {
        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return;
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Try to decrement without blocking.
    ///
    /// Returns `true` if the count was positive and was taken.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Decrement, giving up after `timeout` ticks. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: u64) -> bool {
        let start = crate::time::current_ticks();
        loop {
            if self.try_wait() {
                return true;
            }
            if crate::time::ticks_since(start) >= timeout {
                return false;
            }
            core::hint::spin_loop();
        }
    }

    /// Increment (V operation). Safe from IRQ context.
    pub fn signal(&self) {
        *self.count.lock() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal();
        assert!(sem.try_wait());
    }

    #[test]
    fn signal_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        sem.signal();
        waiter.join().unwrap();
    }
}
