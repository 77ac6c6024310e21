//! x86_64 architecture layer
//!
//! Everything the scheduler needs from the machine: context switching, the
//! local APIC (alarm timer, inter-core interrupts), core parking, and the
//! IDT glue for the ALARM/ICI vectors.

pub mod context;
pub mod interrupts;
pub mod lapic;
pub mod smp;
pub mod timer;

/// Bring the architecture layer up on the boot core. Secondary cores only
/// need `interrupts::init()` and `lapic::init()`.
pub fn init() {
    interrupts::init();
    lapic::init();
    timer::calibrate();
}
