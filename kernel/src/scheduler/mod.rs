//! Thread scheduler
//!
//! Multi-level feedback queues with priority boosting, per-core idle
//! threads, a sorted timeout list, and a two-phase context-switch handoff.
//! Quantum hogs drift down the levels, I/O-bound threads drift up, and the
//! congestion/fail-safe boost keeps the bottom levels from starving.

pub mod core;
pub mod cpu;
pub mod idle;
pub mod thread;

// Re-exports
pub use self::core::scheduler::{sleep_releasing, wakeup, yield_cpu};
pub use self::cpu::{current_ccb, Ccb};
pub use self::idle::run_scheduler;
pub use self::thread::state::{ContextPhase, SchedCause, ThreadKind, ThreadState};
pub use self::thread::tcb::{
    active_threads, spawn_thread, Tcb, PAGE_SIZE, THREAD_STACK_SIZE,
};
pub use crate::arch::timer::{TimeUs, NO_TIMEOUT};

/// Number of priority levels.
pub const PRIORITY_LEVELS: usize = 8;

/// Best priority level; fresh threads start here.
pub const TOP_PRIORITY: i32 = PRIORITY_LEVELS as i32 - 1;

/// Worst priority level.
pub const LOWEST_PRIORITY: i32 = 0;

/// Congestion threshold that triggers a boost.
pub const MAX_CONGESTION: i32 = 20;

/// Selection count at which the fail-safe boost fires.
pub const FAILSAFE_PERIOD: u32 = 500;

/// Base timeslice in microseconds. A thread's actual slice is
/// `QUANTUM_US / (priority + 1)`.
pub const QUANTUM_US: TimeUs = 10_000;

/// Announce the scheduler. The queue state is const-initialized, so there
/// is nothing else to set up before cores call [`run_scheduler`].
pub fn init() {
    log::info!(
        "scheduler ready: {} priority levels, {}us base quantum",
        PRIORITY_LEVELS,
        QUANTUM_US
    );
}
