//! The Kernel Heap
//!
//! A flat block list inside one virtual region. Every block starts with a
//! [`BlockHeader`]; the next header follows the payload directly, so the list
//! is implicit in address order.
//!
//! Releasing a block merges it with the block that follows it when that one is
//! free. Blocks are never merged with the block *before* them on release, so a
//! run of frees in address order leaves separate free blocks behind. The
//! allocation walk folds such runs together as it passes over them.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt, mem,
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{
    constants::memory::HEAP_BLOCK_MAGIC,
    debug, error, info,
    memory::{
        addr::{MemoryWindow, Page, VirtAddr},
        frame_allocator::{FrameAllocator, FrameDeallocator},
        paging::{MapError, PageDirectory, PageFlags},
    },
    trace, warn,
};

/// Alignment of every block and payload: 4 bytes on the 32-bit target.
pub const HEAP_ALIGN: usize = mem::align_of::<usize>();

/// Bytes taken by a block header, rounded up to [`HEAP_ALIGN`].
pub const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>(), HEAP_ALIGN);

/// A block is only split if the leftover can hold a header plus this much.
const MIN_SPLIT_SLACK: usize = HEAP_ALIGN;

const BLOCK_FREE: u32 = 1;
const BLOCK_USED: u32 = 0;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    size: u32,
    free: u32,
}

impl BlockHeader {
    fn is_valid(&self) -> bool {
        self.magic == HEAP_BLOCK_MAGIC
    }

    fn is_free(&self) -> bool {
        self.free == BLOCK_FREE
    }

    fn size(&self) -> usize {
        self.size as usize
    }
}

/// Errors reported by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block is large enough.
    OutOfMemory,
    /// A block header failed its signature check, or a pointer does not
    /// belong to the heap.
    Corruption,
    /// The region handed to the heap is unaligned, too small or too large.
    InvalidRegion,
    /// Mapping the heap region failed.
    Map(MapError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "Kernel heap out of memory"),
            HeapError::Corruption => write!(f, "Kernel heap corruption detected"),
            HeapError::InvalidRegion => write!(f, "Invalid kernel heap region"),
            HeapError::Map(err) => write!(f, "Mapping the kernel heap failed: {}", err),
        }
    }
}

impl From<MapError> for HeapError {
    fn from(err: MapError) -> Self {
        HeapError::Map(err)
    }
}

/// One block as seen by [`KernelHeap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// First payload byte.
    pub ptr: NonNull<u8>,
    /// Payload size in bytes.
    pub size: usize,
    pub free: bool,
}

/// Totals from a full walk of the block list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
}

/// The block-list allocator itself. See [`LockedHeap`] for the shared form.
pub struct KernelHeap {
    base: *mut u8,
    size: usize,
    /// Virtual region mapped by [`KernelHeap::init`], if any.
    mapped: Option<(VirtAddr, usize)>,
}

// SAFETY: the heap owns its region exclusively; access is serialized by the
// caller (`&mut self` or the `LockedHeap` mutex).
unsafe impl Send for KernelHeap {}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl KernelHeap {
    /// A heap with no memory; every allocation fails until it is set up.
    pub const fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            mapped: None,
        }
    }

    /// Maps every page of `[region, region + size)` to a fresh frame and
    /// formats the region as a single free block.
    ///
    /// If a mapping fails, the pages mapped so far are unmapped and their
    /// frames freed again.
    ///
    /// # Safety
    /// `view` must translate the region to memory backed by the new mappings
    /// (identity on hardware once paging is active), and nothing else may use
    /// the region.
    pub unsafe fn init<A>(
        &mut self,
        region: VirtAddr,
        size: usize,
        pages: &mut PageDirectory,
        frames: &mut A,
        view: MemoryWindow,
    ) -> Result<(), HeapError>
    where
        A: FrameAllocator + FrameDeallocator,
    {
        if size == 0 || region.page_offset() != 0 {
            return Err(HeapError::InvalidRegion);
        }

        for (mapped, page) in Page::range(region, size).enumerate() {
            if let Err(err) = pages.create_mapping(page, PageFlags::WRITABLE, frames) {
                error!("heap mapping failed at {:?}: {}", page.start_address(), err);
                for page in Page::range(region, size).take(mapped) {
                    pages.remove_mapping(page, frames);
                }
                return Err(err.into());
            }
        }

        // SAFETY: the region is mapped and the caller vouches for `view`.
        unsafe { self.claim(view.virt(region), size) }?;
        self.mapped = Some((region, size));

        info!("kernel heap: {:?} + {:#x}", region, size);
        Ok(())
    }

    /// Formats `[start, start + size)` as one free block without touching
    /// page tables.
    ///
    /// # Safety
    /// The memory must be writable and owned by the heap from now on.
    pub unsafe fn claim(&mut self, start: *mut u8, size: usize) -> Result<(), HeapError> {
        let size = size & !(HEAP_ALIGN - 1);
        if start.is_null()
            || start as usize % HEAP_ALIGN != 0
            || size < HEADER_SIZE + HEAP_ALIGN
            || size - HEADER_SIZE > u32::MAX as usize
        {
            return Err(HeapError::InvalidRegion);
        }

        self.base = start;
        self.size = size;
        // SAFETY: offset 0 is inside the region we were just given.
        unsafe {
            self.header_ptr(0).write(BlockHeader {
                magic: HEAP_BLOCK_MAGIC,
                size: (size - HEADER_SIZE) as u32,
                free: BLOCK_FREE,
            });
        }
        Ok(())
    }

    /// Unmaps the region set up by [`KernelHeap::init`] and frees its frames.
    /// The heap is empty afterwards.
    pub fn teardown(&mut self, pages: &mut PageDirectory, frames: &mut impl FrameDeallocator) {
        if let Some((region, size)) = self.mapped.take() {
            for page in Page::range(region, size) {
                pages.remove_mapping(page, frames);
            }
            debug!("kernel heap unmapped");
        }
        *self = Self::empty();
    }

    /// Total bytes under management, headers included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocates `size` bytes, rounded up to [`HEAP_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size > self.size {
            return Err(HeapError::OutOfMemory);
        }
        // `self.size` is a multiple of HEAP_ALIGN, so this cannot overflow
        let size = align_up(size.max(1), HEAP_ALIGN);

        let mut offset = 0;
        while offset + HEADER_SIZE <= self.size {
            let header = self.checked_header(offset)?;
            if header.is_free() {
                self.absorb_free_successors(offset);
            }

            // SAFETY: `checked_header` validated the header at `offset`.
            let header = unsafe { &mut *self.header_ptr(offset) };
            if header.is_free() && header.size() >= size {
                if header.size() > size + HEADER_SIZE + MIN_SPLIT_SLACK {
                    let rest = offset + HEADER_SIZE + size;
                    let rest_size = header.size() - size - HEADER_SIZE;
                    // SAFETY: `rest` lies inside the block being split.
                    unsafe {
                        self.header_ptr(rest).write(BlockHeader {
                            magic: HEAP_BLOCK_MAGIC,
                            size: rest_size as u32,
                            free: BLOCK_FREE,
                        });
                    }
                    header.size = size as u32;
                }
                header.free = BLOCK_USED;

                trace!("heap: allocated {} bytes at offset {:#x}", header.size, offset);
                return Ok(self.payload(offset));
            }

            if header.size == 0 {
                break;
            }
            offset = match offset.checked_add(HEADER_SIZE + header.size()) {
                Some(next) => next,
                None => break,
            };
        }

        debug!("heap: no block for {} bytes", size);
        Err(HeapError::OutOfMemory)
    }

    /// Frees a block returned by [`KernelHeap::allocate`].
    ///
    /// Pointers from elsewhere are rejected with [`HeapError::Corruption`]
    /// and nothing is modified.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let offset = self.offset_of(ptr)?;
        let header = self.checked_header(offset)?;
        if header.is_free() {
            warn!("heap: double free at offset {:#x}", offset);
            return Ok(());
        }
        header.free = BLOCK_FREE;

        let next = offset + HEADER_SIZE + header.size();
        if next + HEADER_SIZE <= self.size {
            // SAFETY: `next` is inside the region.
            let successor = unsafe { &mut *self.header_ptr(next) };
            if successor.is_valid() && successor.is_free() {
                header.size += HEADER_SIZE as u32 + successor.size;
                successor.magic = 0;
            }
        }

        trace!("heap: released offset {:#x}", offset);
        Ok(())
    }

    /// Header details for a pointer returned by [`KernelHeap::allocate`].
    pub fn block_of(&self, ptr: NonNull<u8>) -> Result<BlockInfo, HeapError> {
        let offset = self.offset_of(ptr)?;
        // SAFETY: `offset_of` keeps the header inside the region.
        let header = unsafe { &*self.header_ptr(offset) };
        if !header.is_valid() {
            return Err(HeapError::Corruption);
        }
        Ok(BlockInfo {
            ptr,
            size: header.size(),
            free: header.is_free(),
        })
    }

    /// Walks the block list in address order.
    ///
    /// The walk stops early at a corrupted header; use [`KernelHeap::stats`]
    /// to find out whether that happened.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            offset: 0,
        }
    }

    /// Validates every header and totals free and used space.
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats::default();
        let mut offset = 0;
        while offset + HEADER_SIZE <= self.size {
            // SAFETY: `offset` is inside the region.
            let header = unsafe { &*self.header_ptr(offset) };
            if !header.is_valid() {
                return Err(HeapError::Corruption);
            }
            if header.is_free() {
                stats.free_bytes += header.size();
                stats.free_blocks += 1;
            } else {
                stats.used_bytes += header.size();
                stats.used_blocks += 1;
            }
            if header.size == 0 {
                break;
            }
            offset += HEADER_SIZE + header.size();
        }
        Ok(stats)
    }

    /// Merges every free block directly after `offset` into it.
    fn absorb_free_successors(&mut self, offset: usize) {
        loop {
            // SAFETY: callers pass the offset of a validated header.
            let header = unsafe { &mut *self.header_ptr(offset) };
            let next = offset + HEADER_SIZE + header.size();
            if next + HEADER_SIZE > self.size {
                return;
            }
            // SAFETY: `next` is inside the region.
            let successor = unsafe { &mut *self.header_ptr(next) };
            if !successor.is_valid() || !successor.is_free() {
                return;
            }
            header.size += HEADER_SIZE as u32 + successor.size;
            successor.magic = 0;
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn checked_header(&self, offset: usize) -> Result<&mut BlockHeader, HeapError> {
        // SAFETY: callers only pass offsets with room for a header.
        let header = unsafe { &mut *self.header_ptr(offset) };
        if !header.is_valid() {
            error!("heap: bad block signature at offset {:#x}", offset);
            return Err(HeapError::Corruption);
        }
        Ok(header)
    }

    /// Offset of the header that belongs to payload pointer `ptr`.
    fn offset_of(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base as usize;
        if self.size == 0 || addr < base + HEADER_SIZE || addr >= base + self.size {
            return Err(HeapError::Corruption);
        }
        let offset = addr - base - HEADER_SIZE;
        if offset % HEAP_ALIGN != 0 {
            return Err(HeapError::Corruption);
        }
        Ok(offset)
    }

    fn header_ptr(&self, offset: usize) -> *mut BlockHeader {
        self.base.wrapping_add(offset).cast()
    }

    fn payload(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: `base` is non-null whenever a block exists.
        unsafe { NonNull::new_unchecked(self.base.add(offset + HEADER_SIZE)) }
    }
}

/// Iterator returned by [`KernelHeap::blocks`].
pub struct Blocks<'a> {
    heap: &'a KernelHeap,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.offset + HEADER_SIZE > self.heap.size {
            return None;
        }
        // SAFETY: the offset is inside the region.
        let header = unsafe { &*self.heap.header_ptr(self.offset) };
        if !header.is_valid() {
            return None;
        }
        let info = BlockInfo {
            ptr: self.heap.payload(self.offset),
            size: header.size(),
            free: header.is_free(),
        };
        self.offset = if header.size == 0 {
            self.heap.size
        } else {
            self.offset + HEADER_SIZE + header.size()
        };
        Some(info)
    }
}

/// The kernel heap behind a spinlock, usable as `#[global_allocator]`.
pub struct LockedHeap(Mutex<KernelHeap>);

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(KernelHeap::empty()))
    }

    pub fn lock(&self) -> MutexGuard<'_, KernelHeap> {
        self.0.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.lock();
        if layout.align() <= HEAP_ALIGN {
            return heap
                .allocate(layout.size())
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // Over-allocate and keep the raw block pointer just below the
        // aligned one.
        let stash = mem::size_of::<usize>();
        let Some(padded) = layout.size().checked_add(layout.align() + stash) else {
            return ptr::null_mut();
        };
        let Ok(raw) = heap.allocate(padded) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr();
        let aligned = align_up(raw as usize + stash, layout.align());
        let aligned = raw.wrapping_add(aligned - raw as usize);
        // SAFETY: `aligned - stash` lies inside the padded block and is
        // usize-aligned because `aligned` is aligned to more than a word.
        unsafe { aligned.sub(stash).cast::<usize>().write(raw as usize) };
        aligned
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= HEAP_ALIGN {
            ptr
        } else {
            // SAFETY: `alloc` stored the block pointer right below `ptr`.
            let stashed = unsafe { ptr.sub(mem::size_of::<usize>()).cast::<usize>().read() };
            ptr.wrapping_sub(ptr as usize - stashed)
        };
        if let Some(raw) = NonNull::new(raw) {
            if let Err(err) = self.lock().release(raw) {
                error!("heap: dealloc of {:p} failed: {}", ptr, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::bitmap_frame_allocator::BitmapFrameAllocator,
        testing::{host_heap, HostRegion, SimulatedRam},
    };
    use std::vec::Vec;

    const REGION: usize = 4096;

    fn heap() -> KernelHeap {
        host_heap(REGION)
    }

    fn layout(heap: &KernelHeap) -> Vec<(usize, bool)> {
        heap.blocks().map(|b| (b.size, b.free)).collect()
    }

    fn corrupt_header(ptr: NonNull<u8>) {
        unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<u32>().write(0x1234_5678) };
    }

    #[test]
    fn test_claim_creates_single_free_block() {
        let heap = heap();
        assert_eq!(layout(&heap), [(REGION - HEADER_SIZE, true)]);
        assert_eq!(heap.stats().unwrap().free_bytes, REGION - HEADER_SIZE);
    }

    #[test]
    fn test_claim_rejects_bad_regions() {
        let region = HostRegion::new(64);
        let mut heap = KernelHeap::empty();
        let misaligned = region.base.wrapping_add(1);
        assert_eq!(unsafe { heap.claim(misaligned, 64) }, Err(HeapError::InvalidRegion));
        assert_eq!(unsafe { heap.claim(region.base, HEADER_SIZE) }, Err(HeapError::InvalidRegion));
        assert_eq!(
            unsafe { heap.claim(ptr::null_mut(), 64) },
            Err(HeapError::InvalidRegion)
        );
    }

    #[test]
    fn test_empty_heap_is_out_of_memory() {
        let mut heap = KernelHeap::empty();
        assert_eq!(heap.allocate(8), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn test_allocate_rounds_up_and_splits() {
        let mut heap = heap();
        let a = heap.allocate(5).unwrap();
        let b = heap.allocate(1).unwrap();

        assert_eq!(a.as_ptr() as usize % HEAP_ALIGN, 0);
        assert_eq!(
            b.as_ptr() as usize,
            a.as_ptr() as usize + align_up(5, HEAP_ALIGN) + HEADER_SIZE
        );
        assert_eq!(heap.block_of(b).unwrap().size, HEAP_ALIGN);
        assert_eq!(heap.blocks().count(), 3);
    }

    #[test]
    fn test_zero_sized_request_gets_a_block() {
        let mut heap = heap();
        let a = heap.allocate(0).unwrap();
        assert_eq!(heap.block_of(a).unwrap().size, HEAP_ALIGN);
        assert!(heap.allocate(0).is_ok());
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut heap = heap();
        let whole = REGION - HEADER_SIZE;
        // leaves exactly a header plus the minimum slack, which is too small
        let request = whole - HEADER_SIZE - MIN_SPLIT_SLACK;
        let a = heap.allocate(request).unwrap();
        assert_eq!(heap.block_of(a).unwrap().size, whole);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn test_outstanding_blocks_stay_valid() {
        let mut heap = heap();
        let mut live = Vec::new();
        for round in 0..60usize {
            if round % 4 == 3 {
                let ptr = live.remove(round % live.len());
                heap.release(ptr).unwrap();
            } else if let Ok(ptr) = heap.allocate(8 + round % 24) {
                live.push(ptr);
            }
            for ptr in &live {
                let block = heap.block_of(*ptr).unwrap();
                assert!(!block.free);
            }
            assert!(heap.stats().is_ok());
        }
    }

    #[test]
    fn test_release_in_address_order_then_reallocate_combined() {
        let mut heap = heap();
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _guard = heap.allocate(64).unwrap();

        heap.release(a).unwrap();
        heap.release(b).unwrap();
        // release never merges backwards
        assert_eq!(&layout(&heap)[..2], [(64, true), (64, true)]);

        let combined = heap.allocate(64 + HEADER_SIZE + 64).unwrap();
        assert_eq!(combined, a);
        assert!(!heap.block_of(combined).unwrap().free);
    }

    #[test]
    fn test_release_merges_with_following_free_block() {
        let mut heap = heap();
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        let _guard = heap.allocate(32).unwrap();

        heap.release(b).unwrap();
        heap.release(a).unwrap();
        assert_eq!(&layout(&heap)[..2], [(32 + HEADER_SIZE + 32, true), (32, false)]);
        // the absorbed header is no longer a valid block
        assert_eq!(heap.block_of(b), Err(HeapError::Corruption));
    }

    #[test]
    fn test_oversized_request_is_out_of_memory() {
        let mut heap = heap();
        let before = heap.stats().unwrap();
        assert_eq!(heap.allocate(REGION), Err(HeapError::OutOfMemory));
        assert_eq!(heap.allocate(REGION - HEADER_SIZE + 4), Err(HeapError::OutOfMemory));
        assert_eq!(heap.stats().unwrap(), before);

        let _a = heap.allocate(REGION / 2).unwrap();
        assert_eq!(heap.allocate(REGION / 2), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn test_huge_request_is_out_of_memory() {
        let mut heap = heap();
        let before = heap.stats().unwrap();
        assert_eq!(heap.allocate(usize::MAX), Err(HeapError::OutOfMemory));
        assert_eq!(
            heap.allocate(usize::MAX - HEAP_ALIGN + 2),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(heap.stats().unwrap(), before);
        assert!(heap.allocate(64).is_ok());
    }

    #[test]
    fn test_corrupted_header_aborts_allocation() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        corrupt_header(a);
        assert_eq!(heap.allocate(16), Err(HeapError::Corruption));
        assert_eq!(heap.release(a), Err(HeapError::Corruption));
        assert_eq!(heap.stats(), Err(HeapError::Corruption));
    }

    #[test]
    fn test_release_rejects_foreign_pointers() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        let mut outside = 0u64;
        let outside = NonNull::from(&mut outside).cast::<u8>();
        assert_eq!(heap.release(outside), Err(HeapError::Corruption));

        let inside = NonNull::new(a.as_ptr().wrapping_add(HEAP_ALIGN)).unwrap();
        assert_eq!(heap.release(inside), Err(HeapError::Corruption));
        assert!(!heap.block_of(a).unwrap().free);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        heap.release(a).unwrap();
        let before = layout(&heap);
        heap.release(a).unwrap();
        assert_eq!(layout(&heap), before);
    }

    #[test]
    fn test_zero_sized_block_ends_walk() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        unsafe {
            let header = &mut *a.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>();
            header.size = 0;
        }
        assert_eq!(heap.allocate(64), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn test_init_maps_region_and_teardown_returns_frames() {
        let ram = SimulatedRam::new(128);
        let mut frames = unsafe { BitmapFrameAllocator::new(512, 8, ram.window()) }.unwrap();
        let mut pages = unsafe { PageDirectory::new(&mut frames, ram.window()) }.unwrap();
        let before = frames.used_frames();

        let start = VirtAddr::new(0xD000_0000);
        let backing = HostRegion::new(4 * 4096);
        let mut heap = KernelHeap::empty();
        let view = backing.window_at(0xD000_0000);
        unsafe { heap.init(start, 4 * 4096, &mut pages, &mut frames, view) }.unwrap();

        // four heap pages plus one page table
        assert_eq!(frames.used_frames(), before + 5);
        for page in Page::range(start, 4 * 4096) {
            assert!(pages.lookup(page).is_some());
        }
        assert!(heap.allocate(1024).is_ok());

        heap.teardown(&mut pages, &mut frames);
        assert_eq!(frames.used_frames(), before + 1);
        assert_eq!(pages.translate(start), None);
        assert_eq!(heap.allocate(8), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn test_init_rolls_back_when_frames_run_out() {
        let ram = SimulatedRam::new(32);
        let mut frames = unsafe { BitmapFrameAllocator::new(128, 8, ram.window()) }.unwrap();
        let mut pages = unsafe { PageDirectory::new(&mut frames, ram.window()) }.unwrap();
        let before = frames.used_frames();
        let size = (frames.free_frames() + 4) * 4096;

        let backing = HostRegion::new(4096);
        let mut heap = KernelHeap::empty();
        let view = backing.window_at(0xD000_0000);
        let start = VirtAddr::new(0xD000_0000);
        let result = unsafe { heap.init(start, size, &mut pages, &mut frames, view) };
        assert_eq!(result, Err(HeapError::Map(MapError::OutOfFrames)));
        // only the page table survives the rollback
        assert_eq!(frames.used_frames(), before + 1);
        assert_eq!(pages.translate(VirtAddr::new(0xD000_0000)), None);
    }

    #[test]
    fn test_init_rejects_unaligned_region() {
        let ram = SimulatedRam::new(64);
        let mut frames = unsafe { BitmapFrameAllocator::new(256, 8, ram.window()) }.unwrap();
        let mut pages = unsafe { PageDirectory::new(&mut frames, ram.window()) }.unwrap();
        let mut heap = KernelHeap::empty();
        let start = VirtAddr::new(0xD000_0010);
        let view = MemoryWindow::IDENTITY;
        let result = unsafe { heap.init(start, 4096, &mut pages, &mut frames, view) };
        assert_eq!(result, Err(HeapError::InvalidRegion));
    }

    #[test]
    fn test_global_alloc_honours_alignment() {
        let region = HostRegion::new(REGION);
        let locked = LockedHeap::empty();
        unsafe { locked.lock().claim(region.base, region.size) }.unwrap();

        let small = Layout::from_size_align(24, HEAP_ALIGN).unwrap();
        let big = Layout::from_size_align(100, 64).unwrap();
        unsafe {
            let a = locked.alloc(small);
            let b = locked.alloc(big);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(b as usize % 64, 0);
            b.write_bytes(0xAB, 100);

            locked.dealloc(b, big);
            locked.dealloc(a, small);
        }
        assert_eq!(locked.lock().stats().unwrap().used_blocks, 0);

        let huge = Layout::from_size_align(REGION * 2, 8).unwrap();
        assert!(unsafe { locked.alloc(huge) }.is_null());
    }
}
