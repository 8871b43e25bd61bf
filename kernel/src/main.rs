#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::ptr::NonNull;

use hearth::{
    boot::{MultibootInfo, MULTIBOOT_BOOTLOADER_MAGIC},
    idle_loop, info, logging,
    memory::{addr::MemoryWindow, heap::LockedHeap, tlb},
    prelude::*,
    processes::{registers::CpuState, scheduler::ContextSwitch},
    Kernel, KernelConfig,
};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

extern "C" {
    /// Saves the running registers into `old` and resumes `new`. Lives in the
    /// boot stub.
    fn context_switch(old: *mut CpuState, new: *mut CpuState);
}

struct AsmSwitch;

impl ContextSwitch for AsmSwitch {
    unsafe fn switch(&mut self, from: NonNull<CpuState>, to: NonNull<CpuState>) {
        // SAFETY: the scheduler hands over two live save areas.
        unsafe { context_switch(from.as_ptr(), to.as_ptr()) }
    }
}

#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info: &MultibootInfo) -> ! {
    if logging::init().is_err() {
        serial_println!("logger already installed");
    }
    assert_eq!(magic, MULTIBOOT_BOOTLOADER_MAGIC, "not loaded by a multiboot loader");
    let upper_memory_kb = info
        .upper_memory_kb()
        .expect("bootloader did not report memory size");

    tlb::register_flush(tlb::invlpg);

    let config = KernelConfig::default();
    // SAFETY: physical memory is reached 1:1 before and after paging is
    // switched on, and nothing has touched the heap yet.
    let mut kernel = unsafe {
        Kernel::init(
            &config,
            upper_memory_kb,
            MemoryWindow::IDENTITY,
            &ALLOCATOR,
            MemoryWindow::IDENTITY,
            AsmSwitch,
        )
    }
    .expect("kernel init failed");

    let greeting: Vec<u8> = b"hello from hearth\n".iter().copied().collect();
    match kernel
        .create_file("motd")
        .and_then(|inode| kernel.write_file(inode, 0, &greeting))
    {
        Ok(written) => info!("motd: {} bytes", written),
        Err(err) => info!("motd not written: {}", err),
    }

    info!(
        "{} KiB heap, {} frames free",
        config.heap_size / 1024,
        kernel.frames().free_frames()
    );

    loop {
        kernel.schedule();
        // SAFETY: `hlt` only waits for an interrupt.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}
