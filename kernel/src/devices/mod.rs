//! Hardware devices used by the kernel core.
//!
//! Only the COM1 serial port is driven here; screen output and interrupt
//! controllers belong to the boot stub.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod serial;
