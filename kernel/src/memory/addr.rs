//! 32-bit address types and the window used to dereference them.

use core::fmt;

use crate::constants::memory::{FRAME_SIZE, PAGE_SIZE};

/// A physical address on the 32-bit target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// A virtual address on the 32-bit target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Index into the page directory (bits 31..22).
    pub const fn directory_index(self) -> usize {
        ((self.0 >> 22) & 0x3FF) as usize
    }

    /// Index into the page table (bits 21..12).
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE as u32 - 1)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

/// A 4 KiB physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    /// Returns the frame that contains `addr`.
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: PhysAddr(addr.0 & !(FRAME_SIZE as u32 - 1)),
        }
    }

    pub const fn from_index(index: usize) -> Self {
        Self {
            start: PhysAddr((index * FRAME_SIZE) as u32),
        }
    }

    pub const fn start_address(self) -> PhysAddr {
        self.start
    }

    /// Position of this frame in the frame bitmap.
    pub const fn index(self) -> usize {
        self.start.as_usize() / FRAME_SIZE
    }
}

/// A 4 KiB virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    start: VirtAddr,
}

impl Page {
    /// Returns the page that contains `addr`.
    pub const fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: VirtAddr(addr.0 & !(PAGE_SIZE as u32 - 1)),
        }
    }

    pub const fn start_address(self) -> VirtAddr {
        self.start
    }

    /// Pages covering `[start, start + len)`.
    pub fn range(start: VirtAddr, len: usize) -> PageRange {
        let first = Page::containing_address(start);
        let count = (start.page_offset() as usize + len).div_ceil(PAGE_SIZE);
        PageRange {
            next: first.start.as_usize(),
            remaining: count,
        }
    }
}

/// Iterator returned by [`Page::range`].
#[derive(Debug, Clone)]
pub struct PageRange {
    next: usize,
    remaining: usize,
}

impl Iterator for PageRange {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        if self.remaining == 0 {
            return None;
        }
        let page = Page::containing_address(VirtAddr::new(self.next as u32));
        self.next = self.next.wrapping_add(PAGE_SIZE);
        self.remaining -= 1;
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for PageRange {}

/// Translates 32-bit kernel addresses into dereferenceable pointers.
///
/// On hardware physical memory is identity mapped and the heap lives at its
/// own virtual address, so both windows are [`MemoryWindow::IDENTITY`]. Host
/// tests point the window at simulated RAM instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWindow {
    offset: usize,
}

impl MemoryWindow {
    pub const IDENTITY: MemoryWindow = MemoryWindow { offset: 0 };

    /// Creates a window where address `0` is found at `offset`.
    ///
    /// # Safety
    /// Every address later passed through the window must land in memory the
    /// caller owns for the lifetime of the structures built on top of it.
    pub const unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Creates a window where `base` is found at `ptr`.
    ///
    /// # Safety
    /// Same contract as [`MemoryWindow::new`].
    pub unsafe fn anchored(base: u32, ptr: *mut u8) -> Self {
        Self {
            offset: (ptr as usize).wrapping_sub(base as usize),
        }
    }

    pub fn phys<T>(self, addr: PhysAddr) -> *mut T {
        self.offset.wrapping_add(addr.as_usize()) as *mut T
    }

    pub fn virt<T>(self, addr: VirtAddr) -> *mut T {
        self.offset.wrapping_add(addr.as_usize()) as *mut T
    }
}
