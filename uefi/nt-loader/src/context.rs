//! The boot context: the one value threaded through the pipeline instead of
//! module-level globals. Only the firmware system table stays ambient.

use crate::memory::FirmwareMemory;
use loader_vmem::{
    IMAGE_VA_BASE, KERNEL_VA_BASE, MappingError, MappingSet, MemoryKind, PAGE_SIZE, PhysAddr,
    VaCursor, VirtAddr,
};

pub struct BootContext {
    pub memory: FirmwareMemory,
    pub mappings: MappingSet,
    /// Kernel-range cursor for everything that is not an image.
    pub va: VaCursor,
    pub cpu_frequency: u64,
    pub cookie_seed: u32,
}

impl BootContext {
    #[must_use]
    pub fn new(cpu_frequency: u64, cookie_seed: u32) -> Self {
        Self {
            memory: FirmwareMemory,
            mappings: MappingSet::new(),
            va: VaCursor::new(KERNEL_VA_BASE),
            cpu_frequency,
            cookie_seed,
        }
    }

    /// Base of the image placement window; the general cursor is moved past
    /// it once the image set is packed.
    #[must_use]
    pub const fn image_base(&self) -> u64 {
        IMAGE_VA_BASE
    }

    /// Map `pages` at the cursor and advance it.
    pub fn map_at_cursor(
        &mut self,
        pa: PhysAddr,
        pages: u64,
        kind: MemoryKind,
    ) -> Result<VirtAddr, MappingError> {
        let va = self.va.take(pages);
        self.mappings.add(Some(va), pa, pages, kind)?;
        Ok(va)
    }

    /// Map at a fixed well-known virtual address.
    pub fn map_fixed(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        pages: u64,
        kind: MemoryKind,
    ) -> Result<(), MappingError> {
        self.mappings.add(Some(va), pa, pages, kind)
    }

    /// Total pages the kernel-range layout spans so far.
    #[must_use]
    pub fn pages_spanned(&self) -> u64 {
        (self.va.current().as_u64() - KERNEL_VA_BASE) / PAGE_SIZE
    }
}
