//! Physical and virtual memory layout.

pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries in a page directory and in each page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Frames covering the kernel image and low memory (first 1 MiB).
pub const KERNEL_RESERVED_FRAMES: usize = 256;

pub const BITMAP_ENTRY_SIZE: usize = 32;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;

pub const HEAP_START: u32 = 0xD000_0000;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MB

/// Written at the start of every heap block header.
pub const HEAP_BLOCK_MAGIC: u32 = 0xDEAD_BEEF;
