//! Firmware-backed memory: the global allocator for `alloc`, and the page
//! and frame allocators the library crates work through.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::ptr::{NonNull, null_mut};
use loader_vmem::{FrameAlloc, PAGE_SIZE, PageAllocator, PhysAddr, PhysMapper};
use uefi::boot;
use uefi::boot::{AllocateType, MemoryType};

/// UEFI pool allocation backing Rust's global allocator.
///
/// Valid only while boot services are active. Alignment is satisfied by
/// over-allocating and stashing the original pointer in a header word.
pub struct UefiBootAllocator;

#[global_allocator]
static GLOBAL_ALLOC: UefiBootAllocator = UefiBootAllocator;

unsafe impl GlobalAlloc for UefiBootAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(size_of::<usize>());
        let size = layout.size().max(1);
        let Some(total) = size
            .checked_add(align)
            .and_then(|v| v.checked_add(size_of::<usize>()))
        else {
            return null_mut();
        };

        let Ok(raw) = boot::allocate_pool(MemoryType::LOADER_DATA, total) else {
            return null_mut();
        };

        let raw_ptr = raw.as_ptr();
        let addr = raw_ptr as usize + size_of::<usize>();
        let aligned = (addr + (align - 1)) & !(align - 1);
        let header_ptr = (aligned - size_of::<usize>()) as *mut usize;

        unsafe {
            ptr::write(header_ptr, raw_ptr as usize);
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let header_ptr = (ptr as usize - size_of::<usize>()) as *mut usize;
        let orig_ptr = unsafe { ptr::read(header_ptr) as *mut u8 };

        // SAFETY: `orig_ptr` was returned by `allocate_pool` and stored by us.
        let _ = unsafe { boot::free_pool(NonNull::new_unchecked(orig_ptr)) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}

/// `AllocatePages`-backed implementation of the loader allocator traits.
pub struct FirmwareMemory;

impl PageAllocator for FirmwareMemory {
    fn alloc_pages(&mut self, pages: u64) -> Option<PhysAddr> {
        let ptr = boot::allocate_pages(
            AllocateType::AnyPages,
            MemoryType::LOADER_DATA,
            pages as usize,
        )
        .ok()?;
        Some(PhysAddr::new(ptr.as_ptr() as u64))
    }

    fn free_pages(&mut self, base: PhysAddr, pages: u64) {
        if let Some(ptr) = NonNull::new(base.as_ptr()) {
            // SAFETY: only pages from `alloc_pages` come back here.
            let _ = unsafe { boot::free_pages(ptr, pages as usize) };
        }
    }
}

impl FrameAlloc for FirmwareMemory {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let frame = self.alloc_pages(1)?;
        // SAFETY: fresh single-page allocation, identity mapped.
        unsafe {
            ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE as usize);
        }
        Some(frame)
    }
}

/// The loader runs identity-mapped until the final CR3 switch; a physical
/// address is directly dereferenceable.
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}
