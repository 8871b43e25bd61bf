//! Bitmap frame allocator
//!
//! - One bit per 4 KiB frame, 1 = used, 0 = free
//! - The bitmap lives in physical memory right after the kernel-reserved frames
//!   and is sized from the amount of memory reported at boot
//! - Reserved frames and the bitmap's own frames are never handed out or freed

use core::slice;

use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY},
    debug, error, info,
    memory::{
        addr::{MemoryWindow, PhysAddr, PhysFrame},
        frame_allocator::{FrameAllocator, FrameDeallocator, FrameError},
    },
    warn,
};

/// Bitmap frame allocator
///
/// * `bitmap`: one bit per frame, stored in the frames after the reserved area
/// * `total_frames`: frames of physical memory reported at boot
/// * `used_frames`: set bits in `bitmap`
/// * `reserved_frames`: frames `[0, reserved_frames)` are permanently used
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u32],
    total_frames: usize,
    used_frames: usize,
    reserved_frames: usize,
}

impl BitmapFrameAllocator {
    /// Builds the allocator for `upper_memory_kb` KiB of physical memory.
    ///
    /// The first `kernel_reserved_frames` frames are marked used, followed by
    /// the frames that hold the bitmap itself.
    ///
    /// # Safety
    /// `window` must make every physical frame below the reported memory size
    /// writable, and nothing else may use the frames right after the reserved
    /// area.
    pub unsafe fn new(
        upper_memory_kb: u32,
        kernel_reserved_frames: usize,
        window: MemoryWindow,
    ) -> Result<Self, FrameError> {
        let total_frames = upper_memory_kb as usize * 1024 / FRAME_SIZE;
        let bitmap_words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_frames = (bitmap_words * core::mem::size_of::<u32>()).div_ceil(FRAME_SIZE);
        let reserved_frames = kernel_reserved_frames + bitmap_frames;

        if bitmap_words == 0 || reserved_frames > total_frames {
            error!(
                "frame bitmap ({} frames) does not fit after {} reserved frames in {} frames",
                bitmap_frames, kernel_reserved_frames, total_frames
            );
            return Err(FrameError::NoBitmapRegion);
        }

        let bitmap_start = PhysFrame::from_index(kernel_reserved_frames).start_address();
        // SAFETY: the bitmap frames lie inside physical memory and the caller
        // guarantees the window covers them and nobody else owns them.
        let bitmap = unsafe {
            slice::from_raw_parts_mut(window.phys::<u32>(bitmap_start), bitmap_words)
        };
        bitmap.fill(0);

        let mut allocator = Self {
            bitmap,
            total_frames,
            used_frames: 0,
            reserved_frames,
        };
        for frame_index in 0..reserved_frames {
            allocator.set_bit(frame_index);
        }

        info!(
            "frame allocator: {} frames, {} reserved, bitmap at {:?}",
            total_frames, reserved_frames, bitmap_start
        );
        Ok(allocator)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }

    /// Frames that are permanently in use (kernel image plus bitmap).
    pub fn reserved_frames(&self) -> usize {
        self.reserved_frames
    }

    /// Check if frame is used. Frames past the end of memory count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let index = frame.index();
        index >= self.total_frames || self.is_bit_set(index)
    }

    /// Allocates the lowest free frame.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.used_frames >= self.total_frames {
            return None;
        }

        for word_index in 0..self.bitmap.len() {
            let word = self.bitmap[word_index];
            if word == FULL_BITMAP_ENTRY {
                continue;
            }

            let bit_index = (!word).trailing_zeros() as usize;
            let frame_index = word_index * BITMAP_ENTRY_SIZE + bit_index;
            if frame_index >= self.total_frames {
                // only padding bits are left in the last word
                break;
            }

            self.set_bit(frame_index);
            return Some(PhysFrame::from_index(frame_index));
        }

        error!(
            "frame bitmap has no clear bit but only {}/{} frames are used",
            self.used_frames, self.total_frames
        );
        debug_assert!(false, "frame bitmap out of sync with used_frames");
        None
    }

    /// Returns `frame` to the free pool.
    ///
    /// Freeing a free frame does nothing. Reserved frames and frames beyond
    /// the end of memory are ignored.
    pub fn free_frame(&mut self, frame: PhysFrame) {
        let index = frame.index();
        if index < self.reserved_frames || index >= self.total_frames {
            warn!("ignoring free of reserved or foreign frame {:?}", frame.start_address());
            return;
        }
        if self.is_bit_set(index) {
            self.clear_bit(index);
        } else {
            debug!("frame {:?} was already free", frame.start_address());
        }
    }

    /// Start of the bitmap storage in physical memory.
    pub fn bitmap_address(&self) -> PhysAddr {
        PhysFrame::from_index(self.reserved_frames - self.bitmap_frames()).start_address()
    }

    fn bitmap_frames(&self) -> usize {
        (self.bitmap.len() * core::mem::size_of::<u32>()).div_ceil(FRAME_SIZE)
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask == 0 {
            self.bitmap[word_index] |= mask;
            self.used_frames += 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask != 0 {
            self.bitmap[word_index] &= !mask;
            self.used_frames -= 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[word_index] & mask) != 0
    }

    #[cfg(test)]
    fn count_set_bits(&self) -> usize {
        self.bitmap.iter().map(|word| word.count_ones() as usize).sum()
    }
}

unsafe impl FrameAllocator for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        BitmapFrameAllocator::allocate_frame(self)
    }
}

impl FrameDeallocator for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedRam;
    use std::collections::BTreeSet;

    /// 512 KiB of memory with 8 reserved frames.
    fn small_allocator() -> BitmapFrameAllocator {
        let ram = SimulatedRam::new(128);
        unsafe { BitmapFrameAllocator::new(512, 8, ram.window()) }.unwrap()
    }

    #[test]
    fn test_init_reserves_kernel_and_bitmap() {
        let frames = small_allocator();
        assert_eq!(frames.total_frames(), 128);
        // 128 bits fit in one frame
        assert_eq!(frames.reserved_frames(), 9);
        assert_eq!(frames.used_frames(), 9);
        assert_eq!(frames.count_set_bits(), 9);
        assert_eq!(frames.bitmap_address(), PhysAddr::new(8 * 4096));
        assert!(frames.is_frame_used(PhysFrame::from_index(0)));
        assert!(frames.is_frame_used(PhysFrame::from_index(8)));
        assert!(!frames.is_frame_used(PhysFrame::from_index(9)));
    }

    #[test]
    fn test_init_fails_without_room_for_bitmap() {
        let ram = SimulatedRam::new(8);
        let result = unsafe { BitmapFrameAllocator::new(32, 8, ram.window()) };
        assert_eq!(result.err(), Some(FrameError::NoBitmapRegion));

        let result = unsafe { BitmapFrameAllocator::new(0, 0, ram.window()) };
        assert_eq!(result.err(), Some(FrameError::NoBitmapRegion));
    }

    #[test]
    fn test_allocates_lowest_free_frame() {
        let mut frames = small_allocator();
        let first = frames.allocate_frame().unwrap();
        let second = frames.allocate_frame().unwrap();
        assert_eq!(first.index(), 9);
        assert_eq!(second.index(), 10);
        assert_eq!(frames.used_frames(), 11);

        frames.free_frame(first);
        assert_eq!(frames.allocate_frame(), Some(first));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut frames = small_allocator();
        let mut seen = BTreeSet::new();
        while let Some(frame) = frames.allocate_frame() {
            assert!(seen.insert(frame), "frame handed out twice");
            assert!(frames.used_frames() <= frames.total_frames());
        }
        assert_eq!(seen.len(), 128 - 9);
        assert_eq!(frames.used_frames(), frames.total_frames());
        assert_eq!(frames.count_set_bits(), frames.used_frames());
        assert_eq!(frames.allocate_frame(), None);
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut frames = small_allocator();
        let frame = frames.allocate_frame().unwrap();
        frames.free_frame(frame);
        let used = frames.used_frames();
        frames.free_frame(frame);
        assert_eq!(frames.used_frames(), used);
        assert_eq!(frames.count_set_bits(), used);
    }

    #[test]
    fn test_reserved_and_foreign_frames_are_never_freed() {
        let mut frames = small_allocator();
        frames.free_frame(PhysFrame::from_index(0));
        frames.free_frame(PhysFrame::from_index(8));
        frames.free_frame(PhysFrame::from_index(4000));
        assert_eq!(frames.used_frames(), 9);
        assert!(frames.is_frame_used(PhysFrame::from_index(0)));
    }

    #[test]
    fn test_partial_last_word_is_usable_but_bounded() {
        // 100 frames: the last bitmap word only has 4 valid bits
        let ram = SimulatedRam::new(100);
        let mut frames = unsafe { BitmapFrameAllocator::new(400, 2, ram.window()) }.unwrap();
        let mut last = None;
        while let Some(frame) = frames.allocate_frame() {
            last = Some(frame);
        }
        assert_eq!(last.map(PhysFrame::index), Some(99));
        assert_eq!(frames.count_set_bits(), 100);
    }

    #[test]
    fn test_mixed_sequence_keeps_counts_consistent() {
        let mut frames = small_allocator();
        let mut held = std::vec::Vec::new();
        for round in 0..200usize {
            if round % 3 == 2 {
                if let Some(frame) = held.pop() {
                    frames.free_frame(frame);
                }
            } else if let Some(frame) = frames.allocate_frame() {
                assert!(!held.contains(&frame));
                held.push(frame);
            }
            assert_eq!(frames.count_set_bits(), frames.used_frames());
            assert!(frames.used_frames() <= frames.total_frames());
        }
        assert_eq!(frames.used_frames(), 9 + held.len());
    }
}
