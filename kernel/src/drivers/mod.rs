//! Kernel drivers
//!
//! Only the serial port lives here; it is the sink for all kernel logging.

pub mod serial;
