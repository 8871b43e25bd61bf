//! Physical frames, the kernel page directory and the kernel heap.

pub mod addr;
pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;
pub mod paging;
pub mod tlb;

pub use addr::{MemoryWindow, Page, PhysAddr, PhysFrame, VirtAddr};
pub use bitmap_frame_allocator::BitmapFrameAllocator;
pub use heap::{HeapError, KernelHeap, LockedHeap};
pub use paging::{MapError, PageDirectory, PageFlags};
