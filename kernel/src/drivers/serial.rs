//! COM1 serial driver
//!
//! Thin wrapper around the 16550 UART, used as the logging sink.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

/// Write a string to COM1.
pub fn write_str(s: &str) {
    use core::fmt::Write;
    let _ = COM1.lock().write_str(s);
}

/// Write formatted arguments to COM1.
pub fn write_fmt(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = COM1.lock().write_fmt(args);
}
