//! Core identification and parking
//!
//! A core with no work parks itself in `halt_until_kick`; any enqueue on
//! another core wakes at most one sleeper with an ICI. The halted set is a
//! bitmask, so waking is a cheap scan and kicking with no sleepers is a
//! no-op.

use core::sync::atomic::{AtomicU64, Ordering};
use raw_cpuid::CpuId;

use super::{interrupts, lapic};

/// Upper bound on schedulable cores. APIC ids are used as core indices.
pub const MAX_CORES: usize = 32;

/// Bitmask of cores currently halted in `halt_until_kick`.
static HALTED: AtomicU64 = AtomicU64::new(0);

/// Index of the calling core.
pub fn core_id() -> usize {
    let id = CpuId::new()
        .get_feature_info()
        .map(|f| f.initial_local_apic_id() as usize)
        .unwrap_or(0);
    debug_assert!(id < MAX_CORES);
    id
}

/// Park the calling core until any interrupt arrives. Preemption must be
/// enabled by the caller, otherwise nothing can wake us.
pub fn halt_until_kick() {
    let bit = 1u64 << core_id();
    HALTED.fetch_or(bit, Ordering::SeqCst);
    x86_64::instructions::hlt();
    HALTED.fetch_and(!bit, Ordering::SeqCst);
}

/// Wake one halted core, if there is one.
pub fn kick_one() {
    let halted = HALTED.load(Ordering::SeqCst);
    if halted != 0 {
        let core = halted.trailing_zeros();
        lapic::send_fixed_ipi(core, interrupts::ICI_VECTOR);
    }
}

/// Wake every halted core.
pub fn kick_all() {
    let mut halted = HALTED.load(Ordering::SeqCst);
    while halted != 0 {
        let core = halted.trailing_zeros();
        lapic::send_fixed_ipi(core, interrupts::ICI_VECTOR);
        halted &= halted - 1;
    }
}
