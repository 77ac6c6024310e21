//! Quantum alarm and monotonic clock
//!
//! The alarm is the per-core LAPIC timer in one-shot mode; the clock is the
//! TSC. Both are scaled by a PIT-measured calibration taken once at boot:
//! the PIT's gate-2 one-shot gives a known real-time window during which we
//! count TSC cycles and LAPIC timer ticks.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use super::{interrupts, lapic};

/// Microsecond-resolution duration and instant type used by the scheduler.
pub type TimeUs = u64;

/// Sentinel meaning "no scheduled wakeup".
pub const NO_TIMEOUT: TimeUs = TimeUs::MAX;

const PIT_FREQ_HZ: u64 = 1_193_182;
const CALIBRATION_WINDOW_US: u64 = 10_000;

static TSC_CYCLES_PER_US: AtomicU64 = AtomicU64::new(0);
static LAPIC_TICKS_PER_US: AtomicU64 = AtomicU64::new(0);

#[inline]
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic microseconds since boot. Zero until calibrated.
pub fn now_us() -> TimeUs {
    let per_us = TSC_CYCLES_PER_US.load(Ordering::Relaxed);
    if per_us == 0 {
        return 0;
    }
    rdtsc() / per_us
}

/// Arm the calling core's one-shot alarm `us` microseconds out. The ALARM
/// vector fires exactly once.
pub fn arm_alarm_us(us: TimeUs) {
    let per_us = LAPIC_TICKS_PER_US.load(Ordering::Relaxed).max(1);
    let ticks = us
        .saturating_mul(per_us)
        .clamp(1, u32::MAX as u64) as u32;
    lapic::timer_one_shot(interrupts::ALARM_VECTOR, ticks);
}

/// Disarm the calling core's pending alarm, if any.
pub fn cancel_alarm() {
    lapic::timer_stop();
}

/// Measure TSC and LAPIC-timer rates against the PIT. Run once on the boot
/// core with interrupts disabled.
pub fn calibrate() {
    let reload = PIT_FREQ_HZ * CALIBRATION_WINDOW_US / 1_000_000;

    let mut gate: Port<u8> = Port::new(0x61);
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut ch2: Port<u8> = Port::new(0x42);

    unsafe {
        // Gate low, speaker off.
        let g = gate.read() & !0x03;
        gate.write(g);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        cmd.write(0xB0);
        ch2.write((reload & 0xFF) as u8);
        ch2.write((reload >> 8) as u8);

        lapic::timer_free_run();
        let tsc_start = rdtsc();

        // Raising the gate starts the countdown.
        gate.write(g | 0x01);

        // OUT2 (bit 5 of port 0x61) goes high at terminal count.
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }

        let tsc_cycles = rdtsc() - tsc_start;
        let lapic_ticks = (u32::MAX - lapic::timer_current()) as u64;
        lapic::timer_stop();

        TSC_CYCLES_PER_US.store((tsc_cycles / CALIBRATION_WINDOW_US).max(1), Ordering::Relaxed);
        LAPIC_TICKS_PER_US.store((lapic_ticks / CALIBRATION_WINDOW_US).max(1), Ordering::Relaxed);
    }

    log::info!(
        "timer calibrated: {} TSC cycles/us, {} LAPIC ticks/us",
        TSC_CYCLES_PER_US.load(Ordering::Relaxed),
        LAPIC_TICKS_PER_US.load(Ordering::Relaxed)
    );
}
