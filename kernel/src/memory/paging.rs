//! Two-level x86 paging: one page directory of 1024 entries, each pointing
//! to a page table of 1024 entries that map 4 KiB pages.
//!
//! All processes share the single kernel directory; there is no per-process
//! address space.

use core::fmt;

use bitflags::bitflags;

use crate::{
    constants::memory::PAGE_TABLE_ENTRIES,
    debug, info,
    memory::{
        addr::{MemoryWindow, Page, PhysAddr, PhysFrame, VirtAddr},
        frame_allocator::{FrameAllocator, FrameDeallocator},
        tlb,
    },
    trace,
};

bitflags! {
    /// Flags of a page directory or page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

const ADDRESS_MASK: u32 = !0xFFF;

/// One 32-bit directory or table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Self {
        Self(frame.start_address().as_u32() | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(self.0 & ADDRESS_MASK))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#010x}", self.0 & ADDRESS_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or page table; exactly one frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    pub fn entries(&self) -> &[PageTableEntry] {
        &self.entries
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Errors from building or changing mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was left for a page directory or page table.
    OutOfFrames,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfFrames => write!(f, "Out of physical frames"),
        }
    }
}

/// The kernel page directory and the tables hanging off it.
pub struct PageDirectory {
    root: PhysFrame,
    window: MemoryWindow,
}

impl PageDirectory {
    /// Allocates and zeroes a fresh page directory.
    ///
    /// # Safety
    /// `window` must make every frame returned by `frames` writable.
    pub unsafe fn new(
        frames: &mut impl FrameAllocator,
        window: MemoryWindow,
    ) -> Result<Self, MapError> {
        let root = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
        let directory = Self { root, window };
        // SAFETY: the frame was just allocated for us.
        unsafe { directory.table_mut(root) }.zero();

        info!("page directory at {:?}", root.start_address());
        Ok(directory)
    }

    /// Frame holding the page directory (the value loaded into CR3).
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Maps `page` to `frame`, creating the page table if needed.
    ///
    /// An existing mapping is overwritten; its frame is not released. Call
    /// [`PageDirectory::unmap`] first to get it back.
    pub fn map(
        &mut self,
        frame: PhysFrame,
        page: Page,
        flags: PageFlags,
        frames: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        let virt = page.start_address();
        let dir_index = virt.directory_index();

        let mut dir_entry = self.directory()[dir_index];
        if !dir_entry.is_present() {
            let table_frame = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
            // SAFETY: freshly allocated frame, not referenced anywhere yet.
            unsafe { self.table_mut(table_frame) }.zero();
            dir_entry = PageTableEntry::new(
                table_frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | flags,
            );
            self.directory_mut()[dir_index] = dir_entry;
            trace!("new page table {:?} for directory slot {}", table_frame, dir_index);
        }

        // SAFETY: present directory entries always point at page tables we
        // allocated.
        let table = unsafe { self.table_mut(dir_entry.frame()) };
        table[virt.table_index()] = PageTableEntry::new(frame, PageFlags::PRESENT | flags);
        tlb::flush_page(virt);
        Ok(())
    }

    /// Removes the mapping for `page` and returns the frame it pointed at.
    ///
    /// Does nothing when the page table itself is missing. The frame is not
    /// freed.
    pub fn unmap(&mut self, page: Page) -> Option<PhysFrame> {
        let virt = page.start_address();
        let dir_entry = self.directory()[virt.directory_index()];
        if !dir_entry.is_present() {
            return None;
        }

        // SAFETY: see `map`.
        let table = unsafe { self.table_mut(dir_entry.frame()) };
        let old = table[virt.table_index()];
        table[virt.table_index()] = PageTableEntry::empty();
        tlb::flush_page(virt);

        old.is_present().then(|| old.frame())
    }

    /// Frame and flags currently mapped at `page`.
    pub fn lookup(&self, page: Page) -> Option<(PhysFrame, PageFlags)> {
        let entry = self.leaf_entry(page.start_address())?;
        entry.is_present().then(|| (entry.frame(), entry.flags()))
    }

    /// Translates a virtual address to its physical address.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.leaf_entry(virt)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::new(
            entry.frame().start_address().as_u32() | virt.page_offset(),
        ))
    }

    /// Allocates a fresh frame and maps `page` to it.
    pub fn create_mapping<A>(
        &mut self,
        page: Page,
        flags: PageFlags,
        frames: &mut A,
    ) -> Result<PhysFrame, MapError>
    where
        A: FrameAllocator + FrameDeallocator,
    {
        let frame = frames.allocate_frame().ok_or(MapError::OutOfFrames)?;
        if let Err(err) = self.map(frame, page, flags, &mut *frames) {
            // SAFETY: the frame was never mapped.
            unsafe { frames.deallocate_frame(frame) };
            return Err(err);
        }
        Ok(frame)
    }

    /// Unmaps `page` and frees the frame that backed it.
    pub fn remove_mapping(&mut self, page: Page, frames: &mut impl FrameDeallocator) {
        if let Some(frame) = self.unmap(page) {
            // SAFETY: the page no longer references the frame.
            unsafe { frames.deallocate_frame(frame) };
        }
    }

    /// Maps the first `frame_count` frames of physical memory 1:1.
    pub fn identity_map(
        &mut self,
        frame_count: usize,
        flags: PageFlags,
        frames: &mut impl FrameAllocator,
    ) -> Result<(), MapError> {
        for index in 0..frame_count {
            let frame = PhysFrame::from_index(index);
            let page = Page::containing_address(VirtAddr::new(frame.start_address().as_u32()));
            self.map(frame, page, flags, frames)?;
        }
        debug!("identity mapped {} frames", frame_count);
        Ok(())
    }

    /// Frees every page table and the directory itself.
    ///
    /// Frames mapped by leaf entries belong to whoever mapped them and are
    /// left alone.
    pub fn destroy(self, frames: &mut impl FrameDeallocator) {
        for entry in self.directory().entries() {
            if entry.is_present() {
                // SAFETY: the directory is going away with all its tables.
                unsafe { frames.deallocate_frame(entry.frame()) };
            }
        }
        // SAFETY: nothing references the directory after this.
        unsafe { frames.deallocate_frame(self.root) };
    }

    /// Loads this directory into CR3 and turns paging on.
    ///
    /// # Safety
    /// The running code, its stack and every frame the kernel touches through
    /// its physical window must be mapped (see [`PageDirectory::identity_map`]).
    #[cfg(target_arch = "x86")]
    pub unsafe fn activate(&self) {
        let root = self.root.start_address().as_u32();
        unsafe {
            core::arch::asm!(
                "mov cr3, {root}",
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                root = in(reg) root,
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }

    fn leaf_entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let dir_entry = self.directory()[virt.directory_index()];
        if !dir_entry.is_present() {
            return None;
        }
        // SAFETY: see `map`.
        let table = unsafe { self.table(dir_entry.frame()) };
        Some(table[virt.table_index()])
    }

    fn directory(&self) -> &PageTable {
        // SAFETY: `root` is owned by this directory for its whole lifetime.
        unsafe { self.table(self.root) }
    }

    fn directory_mut(&mut self) -> &mut PageTable {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        unsafe { self.table_mut(self.root) }
    }

    /// # Safety
    /// `frame` must hold a page table owned by this directory.
    unsafe fn table(&self, frame: PhysFrame) -> &PageTable {
        unsafe { &*self.window.phys::<PageTable>(frame.start_address()) }
    }

    /// # Safety
    /// `frame` must hold a page table owned by this directory, or be a fresh
    /// frame about to become one.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self, frame: PhysFrame) -> &mut PageTable {
        unsafe { &mut *self.window.phys::<PageTable>(frame.start_address()) }
    }
}
