//! The kernel context: every memory and process subsystem, built in order and
//! torn down in reverse.

use core::ptr::NonNull;

use crate::{
    constants::memory::{HEAP_SIZE, HEAP_START, KERNEL_RESERVED_FRAMES},
    error::KernelError,
    filesys::{FsError, Node, RamFs},
    info,
    memory::{
        addr::{MemoryWindow, Page, PhysFrame, VirtAddr},
        bitmap_frame_allocator::BitmapFrameAllocator,
        heap::LockedHeap,
        paging::{PageDirectory, PageFlags},
    },
    processes::{
        process::ProcessId,
        scheduler::{ContextSwitch, Scheduler},
    },
};

/// Runtime knobs for [`Kernel::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Frames below the kernel end, never handed out.
    pub reserved_frames: usize,
    pub heap_start: VirtAddr,
    pub heap_size: usize,
    /// Map all physical memory 1:1 so paging can be switched on.
    pub identity_map: bool,
    /// Load the directory and enable paging before the heap is touched.
    /// Only honoured on x86, and only together with `identity_map`.
    pub activate_paging: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            reserved_frames: KERNEL_RESERVED_FRAMES,
            heap_start: VirtAddr::new(HEAP_START),
            heap_size: HEAP_SIZE,
            identity_map: true,
            activate_paging: true,
        }
    }
}

pub struct Kernel<S: ContextSwitch> {
    frames: BitmapFrameAllocator,
    pages: PageDirectory,
    heap: &'static LockedHeap,
    scheduler: Scheduler,
    filesystem: RamFs,
    switcher: S,
}

impl<S: ContextSwitch> Kernel<S> {
    /// Brings up frames, the page directory, the heap and the scheduler, in
    /// that order.
    ///
    /// # Safety
    /// `phys_window` must cover all `upper_memory_kb` of physical memory and
    /// `heap_view` must reach the heap region once it is mapped (both are
    /// [`MemoryWindow::IDENTITY`] on hardware). The heap must not be in use.
    pub unsafe fn init(
        config: &KernelConfig,
        upper_memory_kb: u32,
        phys_window: MemoryWindow,
        heap: &'static LockedHeap,
        heap_view: MemoryWindow,
        switcher: S,
    ) -> Result<Self, KernelError> {
        // SAFETY: forwarded from the caller.
        let mut frames = unsafe {
            BitmapFrameAllocator::new(upper_memory_kb, config.reserved_frames, phys_window)
        }?;
        // SAFETY: the window covers every frame `frames` hands out.
        let mut pages = unsafe { PageDirectory::new(&mut frames, phys_window) }?;

        if config.identity_map {
            if let Err(err) =
                pages.identity_map(frames.total_frames(), PageFlags::WRITABLE, &mut frames)
            {
                pages.destroy(&mut frames);
                return Err(err.into());
            }
            #[cfg(target_arch = "x86")]
            if config.activate_paging {
                // SAFETY: all physical memory, the kernel included, is now
                // identity mapped.
                unsafe { pages.activate() };
            }
        }

        let mut scheduler = Scheduler::new(pages.root().start_address());
        {
            let mut locked = heap.lock();
            // SAFETY: forwarded from the caller.
            let mapped = unsafe {
                locked.init(
                    config.heap_start,
                    config.heap_size,
                    &mut pages,
                    &mut frames,
                    heap_view,
                )
            };
            if let Err(err) = mapped {
                pages.destroy(&mut frames);
                return Err(err.into());
            }
            if let Err(err) = scheduler.init(&mut locked) {
                locked.teardown(&mut pages, &mut frames);
                pages.destroy(&mut frames);
                return Err(err.into());
            }
        }

        info!(
            "kernel up: {}/{} frames used",
            frames.used_frames(),
            frames.total_frames()
        );
        Ok(Self {
            frames,
            pages,
            heap,
            scheduler,
            filesystem: RamFs::new(),
            switcher,
        })
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, KernelError> {
        Ok(self.heap.lock().allocate(size)?)
    }

    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<(), KernelError> {
        Ok(self.heap.lock().release(ptr)?)
    }

    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.frames.allocate_frame()
    }

    pub fn free_frame(&mut self, frame: PhysFrame) {
        self.frames.free_frame(frame)
    }

    /// Maps `page` to `frame`; page tables come from the frame allocator.
    pub fn map(
        &mut self,
        frame: PhysFrame,
        page: Page,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        Ok(self.pages.map(frame, page, flags, &mut self.frames)?)
    }

    /// Unmaps `page` and hands back the frame it used, which stays allocated.
    pub fn unmap(&mut self, page: Page) -> Option<PhysFrame> {
        self.pages.unmap(page)
    }

    pub fn create_process(&mut self, name: &str, entry: u32) -> Result<ProcessId, KernelError> {
        Ok(self.scheduler.create(&mut self.heap.lock(), name, entry)?)
    }

    pub fn terminate(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        Ok(self.scheduler.terminate(&mut self.heap.lock(), pid)?)
    }

    pub fn remove_process(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        Ok(self.scheduler.remove_process(&mut self.heap.lock(), pid)?)
    }

    pub fn block(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        Ok(self.scheduler.block(pid)?)
    }

    pub fn unblock(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        Ok(self.scheduler.unblock(pid)?)
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.scheduler.current()
    }

    /// Runs one round of the scheduler.
    pub fn schedule(&mut self) -> Option<ProcessId> {
        self.scheduler.schedule(self.heap, &mut self.switcher)
    }

    pub fn create_file(&mut self, name: &str) -> Result<u32, KernelError> {
        Ok(self.filesystem.create(name)?)
    }

    pub fn write_file(
        &mut self,
        inode: u32,
        offset: usize,
        data: &[u8],
    ) -> Result<usize, KernelError> {
        let file = self.filesystem.file_mut(inode).ok_or(FsError::NotFound)?;
        Ok(file.write(&mut self.heap.lock(), offset, data)?)
    }

    pub fn read_file(
        &self,
        inode: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, KernelError> {
        let file = self.filesystem.file(inode).ok_or(FsError::NotFound)?;
        Ok(file.read(offset, buf)?)
    }

    pub fn remove_file(&mut self, name: &str) -> Result<(), KernelError> {
        Ok(self.filesystem.remove(&mut self.heap.lock(), name)?)
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn pages(&self) -> &PageDirectory {
        &self.pages
    }

    pub fn heap(&self) -> &'static LockedHeap {
        self.heap
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn filesystem(&self) -> &RamFs {
        &self.filesystem
    }

    pub fn switcher(&self) -> &S {
        &self.switcher
    }

    /// Frees files and processes, unmaps the heap and drops the page
    /// directory. The frame allocator is handed back with only its reserved
    /// frames in use.
    pub fn shutdown(mut self) -> Result<BitmapFrameAllocator, KernelError> {
        {
            let mut heap = self.heap.lock();
            self.filesystem.clear(&mut heap)?;
            self.scheduler.shutdown(&mut heap)?;
            heap.teardown(&mut self.pages, &mut self.frames);
        }
        self.pages.destroy(&mut self.frames);

        info!("kernel shut down, {} frames in use", self.frames.used_frames());
        Ok(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{frame_allocator::FrameError, heap::HeapError, paging::MapError},
        processes::process::{ProcessError, ProcessState},
        testing::{leaked_heap, HostRegion, RecordingSwitch, SimulatedRam},
    };

    const HEAP_PAGES: usize = 16;

    fn config() -> KernelConfig {
        KernelConfig {
            reserved_frames: 8,
            heap_start: VirtAddr::new(HEAP_START),
            heap_size: HEAP_PAGES * 4096,
            identity_map: false,
            activate_paging: false,
        }
    }

    fn boot(config: &KernelConfig, ram_frames: usize) -> Kernel<RecordingSwitch> {
        let ram = SimulatedRam::new(ram_frames);
        let region = HostRegion::new(config.heap_size);
        unsafe {
            Kernel::init(
                config,
                (ram_frames * 4) as u32,
                ram.window(),
                leaked_heap(),
                region.window_at(HEAP_START),
                RecordingSwitch::default(),
            )
        }
        .unwrap()
    }

    #[test]
    fn test_init_order_and_frame_usage() {
        let kernel = boot(&config(), 128);
        let frames = kernel.frames();
        // reserved + bitmap, directory, heap pages, one heap page table
        assert_eq!(frames.reserved_frames(), 9);
        assert_eq!(frames.used_frames(), 9 + 1 + HEAP_PAGES + 1);

        let idle = kernel.current().unwrap();
        assert_eq!(kernel.scheduler().idle(), Some(idle));
        assert!(kernel.pages().translate(VirtAddr::new(HEAP_START)).is_some());
        let process = kernel.scheduler().table().get(idle).unwrap();
        assert_eq!(process.page_directory(), kernel.pages().root().start_address());
    }

    #[test]
    fn test_identity_map_covers_physical_memory() {
        let config = KernelConfig {
            identity_map: true,
            ..config()
        };
        let kernel = boot(&config, 128);
        assert_eq!(
            kernel.pages().translate(VirtAddr::new(0x0001_2345)),
            Some(crate::memory::addr::PhysAddr::new(0x0001_2345))
        );
        let frames = kernel.shutdown().unwrap();
        assert_eq!(frames.used_frames(), frames.reserved_frames());
    }

    #[test]
    fn test_init_fails_cleanly() {
        let ram = SimulatedRam::new(8);
        let region = HostRegion::new(4096);
        let result = unsafe {
            Kernel::init(
                &config(),
                32,
                ram.window(),
                leaked_heap(),
                region.window_at(HEAP_START),
                RecordingSwitch::default(),
            )
        };
        assert_eq!(
            result.err(),
            Some(KernelError::Frame(FrameError::NoBitmapRegion))
        );

        // heap needs more frames than there are
        let ram = SimulatedRam::new(16);
        let result = unsafe {
            Kernel::init(
                &config(),
                64,
                ram.window(),
                leaked_heap(),
                region.window_at(HEAP_START),
                RecordingSwitch::default(),
            )
        };
        assert!(matches!(
            result,
            Err(KernelError::Heap(HeapError::Map(MapError::OutOfFrames)))
        ));
    }

    #[test]
    fn test_processes_run_round_robin() {
        let mut kernel = boot(&config(), 128);
        let idle = kernel.current().unwrap();
        let a = kernel.create_process("a", 0xA000).unwrap();
        let b = kernel.create_process("b", 0xB000).unwrap();

        assert_eq!(kernel.schedule(), Some(b));
        kernel.block(a).unwrap();
        assert_eq!(kernel.schedule(), Some(idle));
        kernel.unblock(a).unwrap();
        assert_eq!(kernel.schedule(), Some(b));
        assert_eq!(kernel.schedule(), Some(a));
        assert_eq!(kernel.switcher().incoming_eips(), [0xB000, 0, 0xB000, 0xA000]);

        // a is running, so it is reaped on the next switch
        kernel.terminate(a).unwrap();
        assert_eq!(kernel.current(), None);
        assert_eq!(kernel.schedule(), Some(b));
        assert_eq!(kernel.scheduler().table().state(idle), Some(ProcessState::Ready));
        assert_eq!(kernel.heap().lock().stats().unwrap().used_blocks, 4);
        assert_eq!(
            kernel.remove_process(a),
            Err(KernelError::Process(ProcessError::InvalidHandle))
        );
    }

    #[test]
    fn test_map_and_unmap_through_kernel() {
        let mut kernel = boot(&config(), 128);
        let frame = kernel.allocate_frame().unwrap();
        let page = Page::containing_address(VirtAddr::new(0x0800_0000));

        kernel.map(frame, page, PageFlags::WRITABLE).unwrap();
        assert_eq!(kernel.pages().lookup(page).map(|(f, _)| f), Some(frame));
        assert_eq!(kernel.unmap(page), Some(frame));
        kernel.free_frame(frame);
        assert!(!kernel.frames().is_frame_used(frame));
    }

    #[test]
    fn test_heap_and_files_share_the_heap() {
        let mut kernel = boot(&config(), 128);
        let block = kernel.allocate(100).unwrap();

        let inode = kernel.create_file("notes").unwrap();
        assert_eq!(kernel.write_file(inode, 0, b"kernel").unwrap(), 6);
        let mut buf = [0u8; 6];
        assert_eq!(kernel.read_file(inode, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"kernel");
        assert_eq!(
            kernel.read_file(99, 0, &mut buf),
            Err(KernelError::Fs(FsError::NotFound))
        );

        kernel.remove_file("notes").unwrap();
        kernel.release(block).unwrap();
        // only idle's control block and stack are left
        assert_eq!(kernel.heap().lock().stats().unwrap().used_blocks, 2);
    }

    #[test]
    fn test_shutdown_returns_to_reserved_baseline() {
        let mut kernel = boot(&config(), 128);
        let a = kernel.create_process("a", 0xA000).unwrap();
        kernel.create_process("b", 0xB000).unwrap();
        let inode = kernel.create_file("f").unwrap();
        kernel.write_file(inode, 0, &[1u8; 512]).unwrap();
        kernel.schedule();
        kernel.terminate(a).unwrap();
        let heap = kernel.heap();

        let frames = kernel.shutdown().unwrap();
        assert_eq!(frames.used_frames(), frames.reserved_frames());
        assert_eq!(heap.lock().allocate(8), Err(HeapError::OutOfMemory));
    }
}
