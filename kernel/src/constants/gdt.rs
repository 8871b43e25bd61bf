//! Flat-segment selectors installed by the boot GDT.

/// Ring 0 code segment (GDT entry 1).
pub const KERNEL_CODE_SELECTOR: u32 = 0x08;
/// Ring 0 data segment (GDT entry 2), also used for the stack segment.
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;
