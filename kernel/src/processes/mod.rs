//! Process control blocks and the round-robin scheduler.

pub mod process;
pub mod registers;
pub mod scheduler;

pub use process::{Process, ProcessError, ProcessId, ProcessState, ProcessTable};
pub use registers::CpuState;
pub use scheduler::{ContextSwitch, Scheduler};
