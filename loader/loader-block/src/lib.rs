//! # Loader Parameter Block Assembly
//!
//! Everything the NT kernel reads at entry lives in one contiguous "loader
//! store": the version-specific `LOADER_PARAMETER_BLOCK`, its extension,
//! string scratch, the NLS block, ARC disk information, performance data,
//! the debug device descriptor and the boot-graphics context. The kernel
//! locates the block and the extension at fixed offsets, so the store keeps
//! a union-style region map sized for the largest generation.
//!
//! Structure layouts shifted with every OS release. The version triple is
//! resolved once ([`OsVersion`]) into an offset table ([`StoreLayout`]);
//! the assembly code never probes the target version for shape again.
//!
//! Pointers are handled by construction rather than by a post-hoc walk:
//! while assembling, every slot that holds a physical pointer registers
//! itself with the [`FixupTable`]; a single emission pass materializes the
//! virtual addresses once the mapping plan is final.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod dispatch;
pub mod entries;
mod fixups;
pub mod layouts;
pub mod lists;
mod store;
pub mod time;
pub mod tree;
mod version;

pub use crate::dispatch::StoreLayout;
pub use crate::fixups::{EmitError, FixupTable};
pub use crate::store::{BootGraphics, LoaderStore};
pub use crate::version::*;

/// Kernel stack size in pages (`KERNEL_STACK_SIZE`).
pub const KERNEL_STACK_PAGES: u64 = 8;

/// API-set schema format selector (mirrors the resolver crate's versions
/// without depending on it).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApiSetVersion {
    V2,
    V4,
    V6,
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("no loader block layout for version {0:#06x} build {1}")]
    UnsupportedVersion(u16, u16),
    #[error("out of pages while assembling the loader store")]
    OutOfMemory,
    #[error("string region overflow")]
    StringRegionFull,
    #[error(transparent)]
    Emit(#[from] EmitError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EXTENSION_REGION, STRINGS_REGION};
    use crate::layouts::BlockPaths;
    use alloc::vec::Vec;
    use core::mem::offset_of;
    use loader_vmem::{MappingSet, MemoryKind, PageAllocator, PhysAddr, VirtAddr};

    struct TestAlloc;

    #[repr(C, align(4096))]
    struct PageBlock([u8; 4096]);

    impl PageAllocator for TestAlloc {
        fn alloc_pages(&mut self, pages: u64) -> Option<PhysAddr> {
            let blocks: Vec<PageBlock> = (0..pages).map(|_| PageBlock([0; 4096])).collect();
            let leaked = alloc::boxed::Box::leak(blocks.into_boxed_slice());
            Some(PhysAddr::new(leaked.as_mut_ptr() as u64))
        }

        fn free_pages(&mut self, _base: PhysAddr, _pages: u64) {}
    }

    fn rs5() -> OsVersion {
        OsVersion::detect(0x000a_0000, (17763u32 << 16) | 1).unwrap()
    }

    unsafe fn read_usize(at: PhysAddr) -> usize {
        unsafe { core::ptr::read_unaligned(at.as_u64() as *const usize) }
    }

    fn read_cstr(at: PhysAddr) -> alloc::string::String {
        let mut out = alloc::string::String::new();
        let mut cursor = at.as_u64();
        loop {
            let b = unsafe { *(cursor as *const u8) };
            if b == 0 {
                break;
            }
            out.push(b as char);
            cursor += 1;
        }
        out
    }

    #[test]
    fn store_carries_the_arc_strings_and_paths() {
        let mut alloc = TestAlloc;
        let layout = StoreLayout::new(rs5());
        let paths = layout.block.paths;
        let mut store = LoaderStore::new(layout, &mut alloc, 2_800_000_000, 0x0002_0046).unwrap();

        store
            .set_strings("multi(0)disk(0)rdisk(0)partition(1)", "Windows", "DEBUGPORT=COM1")
            .unwrap();

        let base = store.base();
        unsafe {
            let arc = read_usize(base.add((paths + offset_of!(BlockPaths, arc_boot_device_name)) as u64));
            assert_eq!(
                read_cstr(PhysAddr::new(arc as u64)),
                "multi(0)disk(0)rdisk(0)partition(1)"
            );

            let boot_path =
                read_usize(base.add((paths + offset_of!(BlockPaths, nt_boot_path_name)) as u64));
            assert_eq!(read_cstr(PhysAddr::new(boot_path as u64)), "\\Windows\\");

            let hal_path =
                read_usize(base.add((paths + offset_of!(BlockPaths, nt_hal_path_name)) as u64));
            assert_eq!(read_cstr(PhysAddr::new(hal_path as u64)), "\\");

            let options =
                read_usize(base.add((paths + offset_of!(BlockPaths, load_options)) as u64));
            assert_eq!(read_cstr(PhysAddr::new(options as u64)), "DEBUGPORT=COM1");

            // The string pointers land inside the strings region.
            assert!(arc as u64 >= base.as_u64() + STRINGS_REGION as u64);
        }
    }

    #[test]
    fn extension_size_matches_the_dispatch() {
        let mut alloc = TestAlloc;
        let layout = StoreLayout::new(rs5());
        let expected = layout.extension.size_value;
        let store = LoaderStore::new(layout, &mut alloc, 0, 0).unwrap();
        assert_eq!(store.extension_size(), expected);
    }

    #[test]
    fn emission_rewrites_every_registered_pointer() {
        let mut alloc = TestAlloc;
        let layout = StoreLayout::new(rs5());
        let extension_ptr_offset = layout.block.extension_ptr;
        let mut store = LoaderStore::new(layout, &mut alloc, 0, 0).unwrap();
        store.set_strings("multi(0)disk(0)rdisk(0)partition(1)", "Windows", "").unwrap();

        let store_va = VirtAddr::new(0xffff_f800_0000_0000);
        let mut mappings = MappingSet::new();
        mappings
            .add(Some(store_va), store.base(), store.pages(), MemoryKind::SystemBlock)
            .unwrap();

        let rewritten = unsafe { store.emit(&mappings).unwrap() };
        assert!(rewritten > 10);

        unsafe {
            // The extension pointer now carries the virtual address of the
            // extension region.
            let extension =
                read_usize(store.base().add(extension_ptr_offset as u64)) as u64;
            assert_eq!(extension, store_va.as_u64() + EXTENSION_REGION as u64);

            // Empty list heads point at themselves, virtually.
            let load_order = store.load_order_list_head();
            let flink = read_usize(load_order) as u64;
            let head_va = store_va.as_u64() + (load_order.as_u64() - store.base().as_u64());
            assert_eq!(flink, head_va);
        }
    }

    #[test]
    fn emission_fails_on_an_unmapped_pointer() {
        let mut alloc = TestAlloc;
        let store = LoaderStore::new(StoreLayout::new(rs5()), &mut alloc, 0, 0).unwrap();

        // No mappings at all: the store's own pointers cannot resolve.
        let mappings = MappingSet::new();
        assert!(matches!(
            unsafe { store.emit(&mappings) },
            Err(EmitError::Unmapped { .. })
        ));
    }

    #[test]
    fn kernel_stack_and_registry_are_written_virtually() {
        let mut alloc = TestAlloc;
        let layout = StoreLayout::new(rs5());
        let threads = layout.block.threads;
        let registry_base = layout.block.registry_base;
        let mut store = LoaderStore::new(layout, &mut alloc, 0, 0).unwrap();

        store.set_kernel_stack(VirtAddr::new(0xffff_f800_0123_0000));
        store.set_registry(VirtAddr::new(0xffff_f800_0456_0000), 0x1000);

        unsafe {
            assert_eq!(
                read_usize(store.base().add(threads as u64)),
                0xffff_f800_0123_0000usize
            );
            assert_eq!(
                read_usize(store.base().add(registry_base as u64)),
                0xffff_f800_0456_0000usize
            );
        }
    }
}
