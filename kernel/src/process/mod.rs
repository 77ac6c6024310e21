//! Process-layer surface
//!
//! The scheduler only sees two things from the process layer: the owning
//! PCB's live-thread count, and the per-thread PTCB flag it raises when an
//! exited thread is reaped so joiners can be signalled. Process lifecycle
//! itself lives above this crate's core.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32};

/// Process control block, as seen by the scheduler.
pub struct Pcb {
    /// Number of live threads belonging to this process. Incremented by the
    /// thread API on spawn, decremented by the scheduler when an exited
    /// thread is reaped.
    pub thread_count: AtomicI32,
}

impl Pcb {
    pub const fn new() -> Self {
        Self {
            thread_count: AtomicI32::new(0),
        }
    }
}

impl Default for Pcb {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread process bookkeeping. The scheduler only ever raises
/// `thread_exited`; waking joiners on that flag is the process layer's job.
pub struct Ptcb {
    pub thread_exited: AtomicBool,
}

impl Ptcb {
    pub const fn new() -> Self {
        Self {
            thread_exited: AtomicBool::new(false),
        }
    }
}

impl Default for Ptcb {
    fn default() -> Self {
        Self::new()
    }
}

static BOOT_PCB: Pcb = Pcb::new();

/// The boot process. Owns every core's idle thread.
pub fn boot_pcb() -> NonNull<Pcb> {
    NonNull::from(&BOOT_PCB)
}
