//! Host-side stand-ins for physical memory and the context-switch routine.
//!
//! Buffers are leaked on purpose: the allocators built on top of them hold
//! `'static` borrows, just like they do on hardware.

use std::{alloc, ptr::NonNull, vec::Vec};

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{
        addr::MemoryWindow,
        heap::{KernelHeap, LockedHeap},
    },
    processes::{registers::CpuState, scheduler::ContextSwitch},
};

fn leak_zeroed(size: usize) -> *mut u8 {
    let layout = alloc::Layout::from_size_align(size.max(FRAME_SIZE), FRAME_SIZE).unwrap();
    // SAFETY: layout has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "host allocation failed");
    ptr
}

/// Zeroed, page-aligned memory standing in for physical frames `0..frames`.
pub struct SimulatedRam {
    base: *mut u8,
}

impl SimulatedRam {
    pub fn new(frames: usize) -> Self {
        Self {
            base: leak_zeroed(frames * FRAME_SIZE),
        }
    }

    /// Window where physical address 0 is the start of this buffer.
    pub fn window(&self) -> MemoryWindow {
        unsafe { MemoryWindow::new(self.base as usize) }
    }
}

/// Host memory standing in for a mapped virtual region such as the heap.
pub struct HostRegion {
    pub base: *mut u8,
    pub size: usize,
}

impl HostRegion {
    pub fn new(size: usize) -> Self {
        Self {
            base: leak_zeroed(size),
            size,
        }
    }

    /// Window that places virtual address `start` at the start of this buffer.
    pub fn window_at(&self, start: u32) -> MemoryWindow {
        unsafe { MemoryWindow::anchored(start, self.base) }
    }
}

/// A fresh, unformatted heap with `'static` lifetime.
pub fn leaked_heap() -> &'static LockedHeap {
    std::boxed::Box::leak(std::boxed::Box::new(LockedHeap::empty()))
}

/// A heap formatted over `size` bytes of host memory, without paging.
pub fn host_heap(size: usize) -> KernelHeap {
    let region = HostRegion::new(size);
    let mut heap = KernelHeap::empty();
    unsafe { heap.claim(region.base, region.size) }.unwrap();
    heap
}

/// Like [`host_heap`], behind the lock the scheduler and kernel expect.
pub fn locked_host_heap(size: usize) -> &'static LockedHeap {
    let heap = leaked_heap();
    *heap.lock() = host_heap(size);
    heap
}

/// Records every hand-off instead of switching stacks.
#[derive(Default)]
pub struct RecordingSwitch {
    pub switches: Vec<(NonNull<CpuState>, NonNull<CpuState>)>,
}

impl RecordingSwitch {
    /// Instruction pointers of the incoming processes, in switch order.
    pub fn incoming_eips(&self) -> Vec<u32> {
        self.switches
            .iter()
            .map(|(_, to)| unsafe { to.as_ref() }.eip)
            .collect()
    }
}

impl ContextSwitch for RecordingSwitch {
    unsafe fn switch(&mut self, from: NonNull<CpuState>, to: NonNull<CpuState>) {
        self.switches.push((from, to));
    }
}
