//! Architecture support
//!
//! Only x86_64 is implemented. The scheduler consumes this layer through the
//! re-exported submodules and never reaches for instructions directly.

pub mod x86_64;

pub use self::x86_64::{context, init, interrupts, lapic, smp, timer};
