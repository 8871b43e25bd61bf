//! Frame allocation interface shared by the paging and heap code.

use core::fmt;

use crate::memory::addr::PhysFrame;

/// A source of free 4 KiB physical frames.
///
/// # Safety
/// Implementors must never hand out a frame that is still in use.
pub unsafe trait FrameAllocator {
    /// Allocates one frame, or `None` when physical memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// Returns frames to the allocator they came from.
pub trait FrameDeallocator {
    /// # Safety
    /// The frame must be unused by the caller from this point on.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// Errors raised while setting up the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The reserved frames plus the bitmap do not fit in physical memory.
    NoBitmapRegion,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::NoBitmapRegion => write!(f, "No room for the frame bitmap"),
        }
    }
}

/// Allocator that always fails; used to exercise out-of-frames paths.
#[cfg(test)]
pub struct EmptyFrameAllocator;

#[cfg(test)]
unsafe impl FrameAllocator for EmptyFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        None
    }
}

#[cfg(test)]
impl FrameDeallocator for EmptyFrameAllocator {
    unsafe fn deallocate_frame(&mut self, _frame: PhysFrame) {}
}
