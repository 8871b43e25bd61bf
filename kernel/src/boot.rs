//! Multiboot hand-off.
//!
//! The boot stub passes the bootloader magic and a pointer to this block to
//! the kernel entry point. Only the memory fields are consumed.

/// Value the bootloader leaves in `eax`.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `mem_lower` and `mem_upper` are valid.
const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub drives_length: u32,
    pub drives_addr: u32,
    pub config_table: u32,
    pub boot_loader_name: u32,
    pub apm_table: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u16,
    pub vbe_interface_seg: u16,
    pub vbe_interface_off: u16,
    pub vbe_interface_len: u16,
}

impl MultibootInfo {
    /// KiB of memory above 1 MiB, if the bootloader reported it.
    pub fn upper_memory_kb(&self) -> Option<u32> {
        (self.flags & MULTIBOOT_INFO_MEMORY != 0).then_some(self.mem_upper)
    }
}
