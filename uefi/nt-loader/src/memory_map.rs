//! Firmware memory-map handling: the EFI runtime region mappings, the
//! preserved runtime map for the loader block, and the free/firmware
//! descriptors the kernel's memory manager starts from.

use crate::context::BootContext;
use alloc::vec::Vec;
use loader_vmem::{MappingError, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr};
use log::{info, warn};
use uefi::Status;
use uefi::boot::{self, MemoryType};
use uefi::mem::memory_map::{MemoryMap, MemoryMapOwned};

/// The preserved runtime map handed to 8.1+ kernels through
/// `EfiMemoryMap`.
pub struct RuntimeMap {
    pub buffer: PhysAddr,
    pub size: u32,
    pub descriptor_size: u32,
    pub pages: u64,
}

fn snapshot() -> Result<MemoryMapOwned, Status> {
    boot::memory_map(MemoryType::LOADER_DATA).map_err(|e| e.status())
}

const fn kind_for(ty: MemoryType) -> Option<MemoryKind> {
    match ty {
        MemoryType::CONVENTIONAL => Some(MemoryKind::Free),
        MemoryType::LOADER_CODE
        | MemoryType::LOADER_DATA
        | MemoryType::BOOT_SERVICES_CODE
        | MemoryType::BOOT_SERVICES_DATA => Some(MemoryKind::FirmwareTemporary),
        MemoryType::RUNTIME_SERVICES_CODE
        | MemoryType::RUNTIME_SERVICES_DATA
        | MemoryType::PAL_CODE => Some(MemoryKind::FirmwarePermanent),
        MemoryType::ACPI_RECLAIM => Some(MemoryKind::FirmwareTemporary),
        MemoryType::ACPI_NON_VOLATILE | MemoryType::RESERVED | MemoryType::MMIO => {
            Some(MemoryKind::SpecialMemory)
        }
        MemoryType::UNUSABLE => Some(MemoryKind::Bad),
        _ => None,
    }
}

/// Map the firmware's runtime-services regions into the kernel range and
/// keep a copy of their descriptors (with the assigned virtual addresses)
/// for the loader block.
pub fn map_efi_runtime(ctx: &mut BootContext) -> Result<RuntimeMap, Status> {
    let map = snapshot()?;

    let mut runtime: Vec<(PhysAddr, u64)> = Vec::new();
    for descriptor in map.entries() {
        if descriptor.ty == MemoryType::RUNTIME_SERVICES_CODE
            || descriptor.ty == MemoryType::RUNTIME_SERVICES_DATA
        {
            runtime.push((PhysAddr::new(descriptor.phys_start), descriptor.page_count));
        }
    }

    // One descriptor record per region: {type, pad, phys, virt, pages, attr}
    // in the EFI layout.
    const DESCRIPTOR_SIZE: usize = 48;
    let bytes = (runtime.len() * DESCRIPTOR_SIZE) as u64;
    let pages = bytes.div_ceil(PAGE_SIZE).max(1);
    let buffer = ctx
        .memory
        .alloc_pages(pages)
        .ok_or(Status::OUT_OF_RESOURCES)?;

    for (index, &(pa, page_count)) in runtime.iter().enumerate() {
        let va = ctx
            .map_at_cursor(pa, page_count, MemoryKind::FirmwarePermanent)
            .map_err(|_| Status::OUT_OF_RESOURCES)?;

        let at = buffer.as_u64() as usize + index * DESCRIPTOR_SIZE;
        unsafe {
            core::ptr::write_unaligned(at as *mut u32, MemoryType::RUNTIME_SERVICES_CODE.0);
            core::ptr::write_unaligned((at + 8) as *mut u64, pa.as_u64());
            core::ptr::write_unaligned((at + 16) as *mut u64, va.as_u64());
            core::ptr::write_unaligned((at + 24) as *mut u64, page_count);
            // EFI_MEMORY_RUNTIME
            core::ptr::write_unaligned((at + 32) as *mut u64, 1u64 << 63);
        }
    }

    info!("mapped {} EFI runtime regions", runtime.len());
    Ok(RuntimeMap {
        buffer,
        size: bytes as u32,
        descriptor_size: DESCRIPTOR_SIZE as u32,
        pages,
    })
}

/// Describe all physical memory the explicit mappings do not cover, so the
/// kernel's descriptor list accounts for every page. Regions already
/// claimed by a mapping are clipped out.
pub fn add_firmware_descriptors(ctx: &mut BootContext) -> Result<(), Status> {
    let map = snapshot()?;

    // Snapshot of the claimed physical ranges, sorted by base.
    let claimed: Vec<(u64, u64)> = ctx
        .mappings
        .iter()
        .map(|m| (m.pa.as_u64(), m.pa.as_u64() + m.byte_len()))
        .collect();

    for descriptor in map.entries() {
        let Some(kind) = kind_for(descriptor.ty) else {
            continue;
        };

        let start = descriptor.phys_start;
        let end = start + descriptor.page_count * PAGE_SIZE;
        add_clipped(ctx, start, end, kind, &claimed).map_err(|e| {
            warn!("memory descriptor for {start:#x} failed: {e}");
            Status::OUT_OF_RESOURCES
        })?;
    }

    Ok(())
}

fn add_clipped(
    ctx: &mut BootContext,
    mut start: u64,
    end: u64,
    kind: MemoryKind,
    claimed: &[(u64, u64)],
) -> Result<(), MappingError> {
    while start < end {
        // Find the next claimed range that intersects what is left.
        let next = claimed
            .iter()
            .filter(|&&(c0, c1)| c1 > start && c0 < end)
            .min_by_key(|&&(c0, _)| c0);

        match next {
            Some(&(c0, c1)) if c0 <= start => {
                // Already claimed; skip past it.
                start = c1.min(end);
            }
            Some(&(c0, _)) => {
                ctx.mappings
                    .add(None, PhysAddr::new(start), (c0 - start) / PAGE_SIZE, kind)?;
                start = c0;
            }
            None => {
                ctx.mappings
                    .add(None, PhysAddr::new(start), (end - start) / PAGE_SIZE, kind)?;
                break;
            }
        }
    }
    Ok(())
}

/// Identity ranges the final page table must retain: everything the current
/// memory map knows about, so the tail of the loader (and the first kernel
/// instructions) keep executing after CR3 switches.
pub fn identity_ranges() -> Result<Vec<(PhysAddr, u64)>, Status> {
    let map = snapshot()?;
    let mut ranges: Vec<(PhysAddr, u64)> = Vec::new();

    for descriptor in map.entries() {
        let start = PhysAddr::new(descriptor.phys_start);
        match ranges.last_mut() {
            Some((last, pages))
                if last.as_u64() + *pages * PAGE_SIZE == start.as_u64() =>
            {
                *pages += descriptor.page_count;
            }
            _ => ranges.push((start, descriptor.page_count)),
        }
    }

    Ok(ranges)
}
