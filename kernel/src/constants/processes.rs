pub const KERNEL_STACK_SIZE: usize = 4096;

/// Longest process name kept in a control block, in bytes.
pub const PROCESS_NAME_LEN: usize = 31;

pub const IDLE_PROCESS_NAME: &str = "idle";

/// IF set, plus the always-one reserved bit 1.
pub const INITIAL_EFLAGS: u32 = 0x202;
