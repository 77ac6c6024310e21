//! Idle threads and the per-core scheduler entry
//!
//! Every core runs `run_scheduler` on its boot stack; that stack becomes
//! the core's idle thread. The idle loop parks the core whenever selection
//! comes up empty and tears the scheduler down once the last normal thread
//! is gone.

use crate::arch::interrupts::{self, Vector};
use crate::arch::{smp, timer};

use super::core::scheduler::{self, yield_cpu};
use super::cpu;
use super::thread::state::SchedCause;
use super::thread::tcb;

/// Body of every idle thread. Returns only when no normal threads remain
/// anywhere in the system.
fn idle_loop() {
    // Hand the CPU to real work straight away.
    yield_cpu(SchedCause::Idle);

    // We come back here whenever this core found nothing to run.
    while tcb::active_threads() > 0 {
        smp::halt_until_kick();
        yield_cpu(SchedCause::Idle);
    }

    // Last thread gone: stop the alarm and get every parked core moving so
    // it can observe termination too.
    timer::cancel_alarm();
    smp::kick_all();
}

/// Per-core scheduler entry. Installs the interrupt handlers, turns the
/// calling context into this core's idle thread, and runs until the system
/// drains. Returns with the handlers removed.
pub fn run_scheduler() {
    let ccb = cpu::current_ccb();
    ccb.init_for_this_core();

    log::info!("core {}: scheduler running", ccb.id());

    interrupts::register(Vector::Alarm, scheduler::alarm_handler);
    interrupts::register(Vector::Ici, scheduler::ici_handler);

    interrupts::preempt_on();
    idle_loop();

    debug_assert!(cpu::current_thread() == ccb.idle_tcb());

    interrupts::unregister(Vector::Alarm);
    interrupts::unregister(Vector::Ici);

    log::info!("core {}: scheduler stopped", ccb.id());
}
