//! Raw kernel spinlock
//!
//! The mutex primitive handed to `sleep_releasing`: a bare test-and-set
//! spinlock with no guard and no data. Callers acquire it with preemption
//! already disabled; the scheduler unlocks it on the sleeper's behalf after
//! the sleeper has been marked unschedulable.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

pub struct KMutex {
    locked: AtomicBool,
}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire, spinning until available.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    /// Acquire without spinning. Returns whether the lock was taken.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release. The caller must hold the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock() {
        let m = KMutex::new();
        m.lock();
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }
}
