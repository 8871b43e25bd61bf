//! Kernel logging facility
//!
//! Routes the `log` crate to COM1. The level is fixed at build time: `Debug`
//! for debug builds, `Info` for release builds, `Trace` with the `log-trace`
//! feature.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serializes whole lines onto the serial port
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = self.inner.lock();
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        crate::serial_println!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

fn max_level() -> LevelFilter {
    if cfg!(feature = "log-trace") {
        LevelFilter::Trace
    } else if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`]. Fails if a logger is already set.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level());
    Ok(())
}

/// Convenience macro for trace-level logging
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => (log::trace!($($arg)*));
}

/// Convenience macro for debug-level logging
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (log::debug!($($arg)*));
}

/// Convenience macro for info-level logging
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (log::info!($($arg)*));
}

/// Convenience macro for warning-level logging
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => (log::warn!($($arg)*));
}

/// Convenience macro for error-level logging
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => (log::error!($($arg)*));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_matches_build() {
        let level = max_level();
        if cfg!(feature = "log-trace") {
            assert_eq!(level, LevelFilter::Trace);
        } else if cfg!(debug_assertions) {
            assert_eq!(level, LevelFilter::Debug);
        } else {
            assert_eq!(level, LevelFilter::Info);
        }
    }
}
