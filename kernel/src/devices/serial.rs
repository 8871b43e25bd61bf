//! COM1 output for the kernel log.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: COM1 is only driven through this port.
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Printing to serial is best-effort; the logger sits on top of it and
    // has nowhere else to report a failed write.
    SERIAL1.lock().write_fmt(args).ok();
}

/// Prints formatted text to the serial port.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
