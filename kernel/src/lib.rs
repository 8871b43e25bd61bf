//! A minimal kernel core for 32-bit x86: physical frames, two-level paging,
//! a kernel heap, and round-robin scheduling of kernel threads.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

pub mod boot;
pub mod constants;
pub mod devices;
pub mod error;
pub mod filesys;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;

#[cfg(test)]
mod testing;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use devices::serial;
pub use error::KernelError;
pub use kernel::{Kernel, KernelConfig};

pub mod prelude {
    pub use crate::serial_print;
    pub use crate::serial_println;
}

/// Halts until the next interrupt, forever.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn idle_loop() -> ! {
    loop {
        // SAFETY: `hlt` only waits for an interrupt.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}
