//! Interrupt vectors and the preemption domain
//!
//! The scheduler registers plain `fn()` handlers for the two vectors it
//! cares about — the quantum ALARM and the inter-core ICI — and this module
//! owns the IDT entries that dispatch to them. EOI is sent before the
//! handler runs because the ALARM handler context-switches away and may not
//! return for a long time.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use x86_64::instructions::interrupts as cpu_irq;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use super::lapic;

pub const ALARM_VECTOR: u8 = 0x20;
pub const ICI_VECTOR: u8 = 0x21;

/// The two vectors the scheduler owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    Alarm = 0,
    Ici = 1,
}

/// Registered handlers, stored as raw fn addresses (0 = none).
static HANDLERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt[ALARM_VECTOR].set_handler_fn(alarm_entry);
        idt[ICI_VECTOR].set_handler_fn(ici_entry);
        idt
    };
}

/// Load the IDT on the calling core.
pub fn init() {
    IDT.load();
}

/// Install a handler for `vector`, replacing any previous one.
pub fn register(vector: Vector, handler: fn()) {
    HANDLERS[vector as usize].store(handler as usize, Ordering::SeqCst);
}

/// Remove the handler for `vector`; further interrupts are acknowledged
/// and dropped.
pub fn unregister(vector: Vector) {
    HANDLERS[vector as usize].store(0, Ordering::SeqCst);
}

fn dispatch(vector: Vector) {
    let raw = HANDLERS[vector as usize].load(Ordering::SeqCst);
    lapic::eoi();
    if raw != 0 {
        let handler: fn() = unsafe { mem::transmute(raw) };
        handler();
    }
}

extern "x86-interrupt" fn alarm_entry(_frame: InterruptStackFrame) {
    dispatch(Vector::Alarm);
}

extern "x86-interrupt" fn ici_entry(_frame: InterruptStackFrame) {
    dispatch(Vector::Ici);
}

/// Enter the non-preemptive domain. Returns whether preemption was on, so
/// the caller can restore the previous regime.
pub fn preempt_off() -> bool {
    let was_enabled = cpu_irq::are_enabled();
    cpu_irq::disable();
    was_enabled
}

/// Re-enter the preemptive domain.
pub fn preempt_on() {
    cpu_irq::enable();
}
