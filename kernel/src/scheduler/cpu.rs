//! Per-core control blocks
//!
//! Each core owns a CCB holding its id, its embedded idle TCB, and the
//! pointer to whatever thread it is currently running. A core only ever
//! writes its own slot; the idle TCB is touched by other cores solely
//! through the scheduler lock, like any other TCB.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::arch::smp::{self, MAX_CORES};
use crate::arch::timer::NO_TIMEOUT;
use crate::process;
use crate::scheduler::TOP_PRIORITY;

use super::thread::state::{ContextPhase, ThreadKind, ThreadState};
use super::thread::tcb::Tcb;

/// Core control block.
pub struct Ccb {
    id: AtomicUsize,
    current: AtomicPtr<Tcb>,
    idle_thread: UnsafeCell<Tcb>,
}

// The embedded idle TCB is governed by the same locking discipline as
// every other TCB, so sharing the CCB between cores is sound.
unsafe impl Sync for Ccb {}

impl Ccb {
    const fn new() -> Self {
        Self {
            id: AtomicUsize::new(0),
            current: AtomicPtr::new(core::ptr::null_mut()),
            idle_thread: UnsafeCell::new(Tcb::new_idle()),
        }
    }

    /// This core's id, valid once `init_for_this_core` has run.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    /// Pointer to this core's idle TCB.
    pub(crate) fn idle_tcb(&self) -> NonNull<Tcb> {
        unsafe { NonNull::new_unchecked(self.idle_thread.get()) }
    }

    /// Prepare this core for scheduling. The idle thread adopts the core's
    /// boot stack, so its context gets captured naturally by the first
    /// switch away from it.
    pub(crate) fn init_for_this_core(&self) {
        self.id.store(smp::core_id(), Ordering::Relaxed);

        unsafe {
            let idle = self.idle_thread.get();
            (*idle).owner_pcb = process::boot_pcb().as_ptr();
            (*idle).kind = ThreadKind::Idle;
            (*idle).state = ThreadState::Running;
            (*idle).phase = ContextPhase::Dirty;
            (*idle).wakeup_time = NO_TIMEOUT;
            (*idle).priority = TOP_PRIORITY;
            (*idle).mutex_flag = false;
            (*idle).prev_queue = TOP_PRIORITY;
        }

        self.current.store(self.idle_thread.get(), Ordering::Release);
    }
}

static CORES: [Ccb; MAX_CORES] = {
    const INIT: Ccb = Ccb::new();
    [INIT; MAX_CORES]
};

/// The calling core's CCB.
pub fn current_ccb() -> &'static Ccb {
    &CORES[smp::core_id()]
}

/// The thread running on the calling core.
pub(crate) fn current_thread() -> NonNull<Tcb> {
    let raw = current_ccb().current.load(Ordering::Acquire);
    NonNull::new(raw).expect("scheduler not running on this core")
}

/// Point the calling core at its next thread. Done by the outgoing thread
/// immediately before the context swap.
pub(crate) fn set_current_thread(tcb: NonNull<Tcb>) {
    current_ccb().current.store(tcb.as_ptr(), Ordering::Release);
}
