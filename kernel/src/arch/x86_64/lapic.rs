//! Local APIC in x2APIC mode
//!
//! x2APIC registers are MSR-mapped, which keeps this module free of MMIO
//! setup. Provides the pieces the scheduler layer consumes: EOI, fixed
//! IPIs for waking parked cores, and the one-shot timer backing the
//! quantum alarm.

use raw_cpuid::CpuId;
use x86_64::registers::model_specific::Msr;

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_EOI: u32 = 0x80B;
const X2APIC_SVR: u32 = 0x80F;
const X2APIC_ICR: u32 = 0x830;
const X2APIC_LVT_TIMER: u32 = 0x832;
const X2APIC_INIT_COUNT: u32 = 0x838;
const X2APIC_CUR_COUNT: u32 = 0x839;
const X2APIC_DIV_CONF: u32 = 0x83E;

/// LVT mask bit.
const LVT_MASKED: u64 = 1 << 16;
/// Divide-configuration encoding for divide-by-16.
const DIVIDE_BY_16: u64 = 0b011;
/// Spurious-interrupt vector.
const SPURIOUS_VECTOR: u64 = 0xFF;

/// Enable the local APIC in x2APIC mode on the calling core.
pub fn init() {
    let supported = CpuId::new()
        .get_feature_info()
        .map_or(false, |f| f.has_x2apic());
    if !supported {
        panic!("x2APIC not supported by this CPU");
    }

    unsafe {
        // Bit 10: x2APIC enable, bit 11: APIC global enable.
        let mut base = Msr::new(IA32_APIC_BASE);
        base.write(base.read() | (1 << 10) | (1 << 11));

        // Software-enable with the spurious vector parked at 0xFF.
        let mut svr = Msr::new(X2APIC_SVR);
        svr.write(svr.read() | (1 << 8) | SPURIOUS_VECTOR);

        Msr::new(X2APIC_DIV_CONF).write(DIVIDE_BY_16);
    }

    log::debug!("LAPIC enabled in x2APIC mode");
}

/// Signal end-of-interrupt. Must run before a handler context-switches away.
#[inline]
pub fn eoi() {
    unsafe {
        Msr::new(X2APIC_EOI).write(0);
    }
}

/// Send a fixed-delivery IPI to the core with the given APIC id.
pub fn send_fixed_ipi(apic_id: u32, vector: u8) {
    // Level-assert (bit 14), fixed delivery mode, physical destination.
    let icr = ((apic_id as u64) << 32) | (1 << 14) | vector as u64;
    unsafe {
        Msr::new(X2APIC_ICR).write(icr);
    }
}

/// Arm the timer in one-shot mode: `vector` fires after `ticks` bus ticks
/// (at the configured divider).
pub fn timer_one_shot(vector: u8, ticks: u32) {
    unsafe {
        Msr::new(X2APIC_LVT_TIMER).write(vector as u64);
        Msr::new(X2APIC_INIT_COUNT).write(ticks as u64);
    }
}

/// Let the timer count down from the maximum with its interrupt masked.
/// Used for calibration only.
pub fn timer_free_run() {
    unsafe {
        Msr::new(X2APIC_LVT_TIMER).write(LVT_MASKED);
        Msr::new(X2APIC_INIT_COUNT).write(u32::MAX as u64);
    }
}

/// Current countdown value.
pub fn timer_current() -> u32 {
    unsafe { Msr::new(X2APIC_CUR_COUNT).read() as u32 }
}

/// Stop the timer and mask its LVT entry.
pub fn timer_stop() {
    unsafe {
        Msr::new(X2APIC_INIT_COUNT).write(0);
        Msr::new(X2APIC_LVT_TIMER).write(LVT_MASKED);
    }
}
