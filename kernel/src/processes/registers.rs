use core::{fmt, mem};

use crate::constants::{
    gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR},
    processes::INITIAL_EFLAGS,
};

/// Register file saved and restored by the context-switch routine.
///
/// The field order is the layout the switch routine expects; do not reorder.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CpuState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub ss: u32,
}

/// Bytes reserved at the top of a kernel stack for the saved state.
pub const CPU_STATE_SIZE: usize = mem::size_of::<CpuState>();

impl CpuState {
    pub const fn zeroed() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
            eflags: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
        }
    }

    /// Registers for a kernel-mode thread that starts at `entry`, with its
    /// stack pointer at `stack_pointer` (the address of this record).
    pub fn new(entry: u32, stack_pointer: u32) -> Self {
        Self {
            esp: stack_pointer,
            ebp: stack_pointer,
            eip: entry,
            eflags: INITIAL_EFLAGS,
            cs: KERNEL_CODE_SELECTOR,
            ds: KERNEL_DATA_SELECTOR,
            es: KERNEL_DATA_SELECTOR,
            fs: KERNEL_DATA_SELECTOR,
            gs: KERNEL_DATA_SELECTOR,
            ss: KERNEL_DATA_SELECTOR,
            ..Self::zeroed()
        }
    }
}

impl fmt::Debug for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("CpuState");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("ds", &format_args!("{:#06x}", self.ds))
            .field("es", &format_args!("{:#06x}", self.es))
            .field("fs", &format_args!("{:#06x}", self.fs))
            .field("gs", &format_args!("{:#06x}", self.gs))
            .field("ss", &format_args!("{:#06x}", self.ss));

        ds.finish()
    }
}
