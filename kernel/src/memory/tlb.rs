//! Translation cache invalidation.
//!
//! Page table updates call [`flush_page`], which dispatches to the flush
//! routine registered at boot. Until then (and in host tests) it is a no-op,
//! which is fine before paging is enabled.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::memory::addr::VirtAddr;

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the routine used to drop one cached translation.
pub fn register_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Invalidates the cached translation for the page holding `virt`.
pub fn flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: only `register_flush` and the initializer store into
    // TLB_FLUSH_FN, both with a valid `fn(VirtAddr)`.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// `invlpg` on the current CPU. Register with [`register_flush`] once paging
/// is on.
#[cfg(target_arch = "x86")]
pub fn invlpg(virt: VirtAddr) {
    // SAFETY: dropping a cached translation has no other effect.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) virt.as_u32(),
            options(nostack, preserves_flags)
        );
    }
}
