//! Emission of the records that live outside the store: the load-order
//! image list, the boot-driver list entries, the memory descriptor list and
//! the ARC disk signatures. Each family is packed into one page allocation
//! and spliced into its list head.

use crate::BlockError;
use crate::fixups::FixupTable;
use crate::layouts::{
    ArcDiskSignature, ArcDiskSignatureWin7, BootDriverListEntry, KldrDataTableEntry,
    LDRE_DONT_RELOCATE, LDRE_ENTRY_PROCESSED, LDRP_DRIVER_DEPENDENT_DLL,
    LDRP_IMAGE_INTEGRITY_FORCED, ListEntry, UnicodeString,
};
use crate::lists::insert_tail;
use alloc::string::String;
use alloc::vec::Vec;
use core::mem::offset_of;
use loader_vmem::{MappingSet, PAGE_SIZE, PageAllocator, PhysAddr, VirtAddr, page_count};

const SYSTEM_ROOT: &str = "\\SystemRoot\\";
const REGISTRY_PREFIX: &str = "\\Registry\\Machine\\System\\CurrentControlSet\\Services\\";

/// Input for one `KLDR_DATA_TABLE_ENTRY`.
pub struct ImageListEntry<'a> {
    pub name: &'a str,
    pub dir: &'a str,
    pub dll_base: VirtAddr,
    pub size_of_image: u32,
    pub entry_point: VirtAddr,
    pub check_sum: u32,
    pub is_dll: bool,
    pub force_integrity: bool,
    pub dont_relocate: bool,
    /// Boot-driver list entry to back-link from (`LdrEntry`).
    pub bdle: Option<PhysAddr>,
}

struct Emitter<'a> {
    cursor: u64,
    end: u64,
    fixups: &'a mut FixupTable,
}

impl<'a> Emitter<'a> {
    fn new(
        bytes: u64,
        alloc: &mut dyn PageAllocator,
        fixups: &'a mut FixupTable,
    ) -> Result<(Self, PhysAddr, u64), BlockError> {
        let pages = page_count(bytes);
        let base = alloc.alloc_pages(pages).ok_or(BlockError::OutOfMemory)?;
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0, (pages * PAGE_SIZE) as usize);
        }
        Ok((
            Self {
                cursor: base.as_u64(),
                end: base.as_u64() + pages * PAGE_SIZE,
                fixups,
            },
            base,
            pages,
        ))
    }

    fn take(&mut self, bytes: u64, align: u64) -> Result<PhysAddr, BlockError> {
        let at = (self.cursor + align - 1) & !(align - 1);
        if at + bytes > self.end {
            return Err(BlockError::OutOfMemory);
        }
        self.cursor = at + bytes;
        Ok(PhysAddr::new(at))
    }

    /// Copy a UTF-16 string (NUL-terminated) and return its address and
    /// byte length (without the terminator).
    fn put_utf16(&mut self, parts: &[&str]) -> Result<(PhysAddr, u16), BlockError> {
        let units: Vec<u16> = parts
            .iter()
            .flat_map(|p| p.encode_utf16())
            .chain(core::iter::once(0))
            .collect();
        let at = self.take((units.len() * 2) as u64, 2)?;
        for (i, unit) in units.iter().enumerate() {
            unsafe {
                core::ptr::write_unaligned((at.as_u64() as usize + i * 2) as *mut u16, *unit);
            }
        }
        Ok((at, ((units.len() - 1) * 2) as u16))
    }

    fn put_ascii(&mut self, text: &str) -> Result<PhysAddr, BlockError> {
        let at = self.take(text.len() as u64 + 1, 1)?;
        unsafe {
            core::ptr::copy_nonoverlapping(text.as_ptr(), at.as_u64() as *mut u8, text.len());
        }
        Ok(at)
    }

    fn write_unicode_string(
        &mut self,
        record: PhysAddr,
        field: usize,
        buffer: PhysAddr,
        bytes: u16,
    ) {
        unsafe {
            let at = record.as_u64() as usize + field;
            core::ptr::write_unaligned(at as *mut u16, bytes);
            core::ptr::write_unaligned(
                (at + offset_of!(UnicodeString, maximum_length)) as *mut u16,
                bytes,
            );
            core::ptr::write_unaligned(
                (at + offset_of!(UnicodeString, buffer)) as *mut usize,
                buffer.as_u64() as usize,
            );
        }
        self.fixups
            .register(record.add((field + offset_of!(UnicodeString, buffer)) as u64));
    }
}

unsafe fn field_write<T>(record: PhysAddr, offset: usize, value: T) {
    unsafe {
        core::ptr::write_unaligned((record.as_u64() as usize + offset) as *mut T, value);
    }
}

/// Emit the `KLDR_DATA_TABLE_ENTRY` list and splice it into the load-order
/// head. Returns the backing allocation.
pub fn write_image_list(
    entries: &[ImageListEntry<'_>],
    load_order_head: PhysAddr,
    alloc: &mut dyn PageAllocator,
    fixups: &mut FixupTable,
) -> Result<(PhysAddr, u64), BlockError> {
    let mut bytes = 0u64;
    for entry in entries {
        bytes += size_of::<KldrDataTableEntry>() as u64 + 16;
        bytes += ((entry.name.len() + 1) * 2) as u64;
        bytes += ((SYSTEM_ROOT.len() + entry.dir.len() + 1 + entry.name.len() + 1) * 2) as u64;
    }

    let (mut emitter, base, pages) = Emitter::new(bytes, alloc, fixups)?;

    for entry in entries {
        let dte = emitter.take(size_of::<KldrDataTableEntry>() as u64, 8)?;

        unsafe {
            field_write(
                dte,
                offset_of!(KldrDataTableEntry, dll_base),
                entry.dll_base.as_u64() as usize,
            );
            field_write(
                dte,
                offset_of!(KldrDataTableEntry, entry_point),
                entry.entry_point.as_u64() as usize,
            );
            field_write(
                dte,
                offset_of!(KldrDataTableEntry, size_of_image),
                entry.size_of_image,
            );
            field_write(dte, offset_of!(KldrDataTableEntry, check_sum), entry.check_sum);
            field_write(dte, offset_of!(KldrDataTableEntry, load_count), 1u16);

            let mut entry_flags = LDRE_ENTRY_PROCESSED;
            if entry.dont_relocate {
                entry_flags |= LDRE_DONT_RELOCATE;
            }
            field_write(dte, offset_of!(KldrDataTableEntry, entry_flags), entry_flags);

            let mut flags = 0u32;
            if entry.is_dll {
                flags |= LDRP_DRIVER_DEPENDENT_DLL;
            }
            if entry.force_integrity {
                flags |= LDRP_IMAGE_INTEGRITY_FORCED;
            }
            field_write(dte, offset_of!(KldrDataTableEntry, flags), flags);
        }

        let (base_name, base_len) = emitter.put_utf16(&[entry.name])?;
        emitter.write_unicode_string(
            dte,
            offset_of!(KldrDataTableEntry, base_dll_name),
            base_name,
            base_len,
        );

        let (full_name, full_len) =
            emitter.put_utf16(&[SYSTEM_ROOT, entry.dir, "\\", entry.name])?;
        emitter.write_unicode_string(
            dte,
            offset_of!(KldrDataTableEntry, full_dll_name),
            full_name,
            full_len,
        );

        unsafe {
            insert_tail(
                load_order_head,
                dte.add(offset_of!(KldrDataTableEntry, in_load_order_links) as u64),
                emitter.fixups,
            );
        }

        if let Some(bdle) = entry.bdle {
            unsafe {
                field_write(
                    bdle,
                    offset_of!(BootDriverListEntry, ldr_entry),
                    dte.as_u64() as usize,
                );
            }
            emitter
                .fixups
                .register(bdle.add(offset_of!(BootDriverListEntry, ldr_entry) as u64));
        }
    }

    Ok((base, pages))
}

/// Input for one `BOOT_DRIVER_LIST_ENTRY`.
pub struct DriverListEntry<'a> {
    pub service: &'a str,
    pub file: &'a str,
    pub dir: &'a str,
    /// Splice into the core-driver list instead of the boot-driver list.
    pub core: bool,
}

/// Emit the boot-driver list entries, splicing each into the boot or core
/// head. Returns the allocation plus the entry address per driver (in input
/// order) for `LdrEntry` back-links.
pub fn write_boot_driver_list(
    drivers: &[DriverListEntry<'_>],
    boot_head: PhysAddr,
    core_head: Option<PhysAddr>,
    alloc: &mut dyn PageAllocator,
    fixups: &mut FixupTable,
) -> Result<(PhysAddr, u64, Vec<PhysAddr>), BlockError> {
    let mut bytes = 0u64;
    for driver in drivers {
        bytes += size_of::<BootDriverListEntry>() as u64 + 16;
        bytes += ((driver.dir.len() + 1 + driver.file.len() + 1) * 2) as u64;
        bytes += ((REGISTRY_PREFIX.len() + driver.service.len() + 1) * 2) as u64;
    }

    let (mut emitter, base, pages) = Emitter::new(bytes.max(1), alloc, fixups)?;
    let mut records = Vec::with_capacity(drivers.len());

    for driver in drivers {
        let bdle = emitter.take(size_of::<BootDriverListEntry>() as u64, 8)?;

        let (file_path, file_len) = emitter.put_utf16(&[driver.dir, "\\", driver.file])?;
        emitter.write_unicode_string(
            bdle,
            offset_of!(BootDriverListEntry, file_path),
            file_path,
            file_len,
        );

        let (reg_path, reg_len) = emitter.put_utf16(&[REGISTRY_PREFIX, driver.service])?;
        emitter.write_unicode_string(
            bdle,
            offset_of!(BootDriverListEntry, registry_path),
            reg_path,
            reg_len,
        );

        let head = if driver.core {
            core_head.unwrap_or(boot_head)
        } else {
            boot_head
        };
        unsafe {
            insert_tail(
                head,
                bdle.add(offset_of!(BootDriverListEntry, link) as u64),
                emitter.fixups,
            );
        }

        records.push(bdle);
    }

    Ok((base, pages, records))
}

/// `MEMORY_ALLOCATION_DESCRIPTOR`.
#[repr(C)]
pub struct MemoryAllocationDescriptor {
    pub list_entry: ListEntry,
    pub memory_type: u32,
    pub pad: u32,
    pub base_page: usize,
    pub page_count: usize,
}

/// Pages needed for a descriptor list of `entries` records.
#[must_use]
pub fn memory_descriptor_pages(entries: usize) -> u64 {
    page_count((entries * size_of::<MemoryAllocationDescriptor>()) as u64).max(1)
}

/// Emit the memory descriptor list from the mapping plan into a caller
/// -provided buffer (it must be mapped before the plan is finalized, since
/// the plan describes it too), sorted by base page (the plan iterates in
/// physical order already).
pub fn write_memory_descriptors(
    mappings: &MappingSet,
    head: PhysAddr,
    buffer: PhysAddr,
    buffer_pages: u64,
    fixups: &mut FixupTable,
) -> Result<(), BlockError> {
    let mut emitter = Emitter {
        cursor: buffer.as_u64(),
        end: buffer.as_u64() + buffer_pages * PAGE_SIZE,
        fixups,
    };

    for mapping in mappings.iter() {
        let descriptor = emitter.take(size_of::<MemoryAllocationDescriptor>() as u64, 8)?;
        unsafe {
            field_write(
                descriptor,
                offset_of!(MemoryAllocationDescriptor, memory_type),
                mapping.kind as u32,
            );
            field_write(
                descriptor,
                offset_of!(MemoryAllocationDescriptor, base_page),
                (mapping.pa.as_u64() / PAGE_SIZE) as usize,
            );
            field_write(
                descriptor,
                offset_of!(MemoryAllocationDescriptor, page_count),
                mapping.pages as usize,
            );
            insert_tail(
                head,
                descriptor.add(offset_of!(MemoryAllocationDescriptor, list_entry) as u64),
                emitter.fixups,
            );
        }
    }

    Ok(())
}

/// One block device as reported by the disk enumerator.
pub struct ArcDiskEntry {
    pub arc_name: String,
    pub signature: u32,
    pub check_sum: u32,
    pub valid_partition_table: bool,
    pub is_gpt: bool,
    pub gpt_signature: [u8; 16],
}

/// Emit the ARC disk signature list. `new_format` selects the GPT-aware
/// record (Vista SP2 / Win7 and later).
pub fn write_arc_disk_list(
    disks: &[ArcDiskEntry],
    head: PhysAddr,
    new_format: bool,
    alloc: &mut dyn PageAllocator,
    fixups: &mut FixupTable,
) -> Result<(PhysAddr, u64), BlockError> {
    let record_size = if new_format {
        size_of::<ArcDiskSignatureWin7>()
    } else {
        size_of::<ArcDiskSignature>()
    };

    let mut bytes = 0u64;
    for disk in disks {
        bytes += (record_size + 8) as u64 + disk.arc_name.len() as u64 + 1;
    }

    let (mut emitter, base, pages) = Emitter::new(bytes.max(1), alloc, fixups)?;

    for disk in disks {
        let record = emitter.take(record_size as u64, 8)?;
        let name = emitter.put_ascii(&disk.arc_name)?;

        unsafe {
            // The shared prefix of both record formats.
            field_write(
                record,
                offset_of!(ArcDiskSignature, signature),
                disk.signature,
            );
            field_write(
                record,
                offset_of!(ArcDiskSignature, arc_name),
                name.as_u64() as usize,
            );
            field_write(
                record,
                offset_of!(ArcDiskSignature, check_sum),
                disk.check_sum,
            );
            field_write(
                record,
                offset_of!(ArcDiskSignature, valid_partition_table),
                u8::from(disk.valid_partition_table),
            );

            if new_format {
                field_write(
                    record,
                    offset_of!(ArcDiskSignatureWin7, is_gpt),
                    u8::from(disk.is_gpt),
                );
                field_write(
                    record,
                    offset_of!(ArcDiskSignatureWin7, gpt_signature),
                    disk.gpt_signature,
                );
            }

            insert_tail(
                head,
                record.add(offset_of!(ArcDiskSignature, list_entry) as u64),
                emitter.fixups,
            );
        }

        emitter
            .fixups
            .register(record.add(offset_of!(ArcDiskSignature, arc_name) as u64));
    }

    Ok((base, pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::{for_each, init_list_head, list_len};
    use loader_vmem::{MemoryKind, VirtAddr};

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

    fn list_head() -> PhysAddr {
        let mut alloc = TestAlloc;
        alloc.alloc_pages(1).unwrap()
    }

    unsafe fn read_usize(at: PhysAddr) -> usize {
        unsafe { core::ptr::read_unaligned(at.as_u64() as *const usize) }
    }

    #[test]
    fn image_list_entries_link_in_order_with_names() {
        let mut alloc = TestAlloc;
        let mut fixups = FixupTable::new();
        let head = list_head();
        unsafe { init_list_head(head, &mut fixups) };

        let entries = [
            ImageListEntry {
                name: "ntoskrnl.exe",
                dir: "system32",
                dll_base: VirtAddr::new(0xffff_f808_0000_0000),
                size_of_image: 0x80_0000,
                entry_point: VirtAddr::new(0xffff_f808_0040_0000),
                check_sum: 0x1234,
                is_dll: false,
                force_integrity: false,
                dont_relocate: true,
                bdle: None,
            },
            ImageListEntry {
                name: "hal.dll",
                dir: "system32",
                dll_base: VirtAddr::new(0xffff_f808_0080_0000),
                size_of_image: 0x10_0000,
                entry_point: VirtAddr::new(0xffff_f808_0081_0000),
                check_sum: 0x5678,
                is_dll: true,
                force_integrity: false,
                dont_relocate: true,
                bdle: None,
            },
        ];

        let (base, pages) =
            write_image_list(&entries, head, &mut alloc, &mut fixups).unwrap();
        assert!(pages >= 1);

        unsafe {
            assert_eq!(list_len(head), 2);

            let mut seen = Vec::new();
            for_each(head, |link| {
                let dte = PhysAddr::new(
                    link.as_u64() - offset_of!(KldrDataTableEntry, in_load_order_links) as u64,
                );
                seen.push(dte);
            });

            // First entry is the kernel with its base/entry/checksum.
            let kernel = seen[0];
            assert_eq!(
                read_usize(kernel.add(offset_of!(KldrDataTableEntry, dll_base) as u64)),
                0xffff_f808_0000_0000usize
            );

            // Base name buffer holds UTF-16 "ntoskrnl.exe".
            let name_field = kernel.add(offset_of!(KldrDataTableEntry, base_dll_name) as u64);
            let len =
                core::ptr::read_unaligned(name_field.as_u64() as *const u16) as usize;
            assert_eq!(len, "ntoskrnl.exe".len() * 2);

            let _ = base;
        }
    }

    #[test]
    fn driver_entries_split_between_boot_and_core() {
        let mut alloc = TestAlloc;
        let mut fixups = FixupTable::new();
        let boot = list_head();
        let core = list_head();
        unsafe {
            init_list_head(boot, &mut fixups);
            init_list_head(core, &mut fixups);
        }

        let drivers = [
            DriverListEntry {
                service: "disk",
                file: "disk.sys",
                dir: "system32\\drivers",
                core: false,
            },
            DriverListEntry {
                service: "acpiex",
                file: "acpiex.sys",
                dir: "system32\\drivers",
                core: true,
            },
        ];

        let (_, _, records) =
            write_boot_driver_list(&drivers, boot, Some(core), &mut alloc, &mut fixups)
                .unwrap();

        assert_eq!(records.len(), 2);
        unsafe {
            assert_eq!(list_len(boot), 1);
            assert_eq!(list_len(core), 1);
        }
    }

    #[test]
    fn memory_descriptors_cover_every_mapping() {
        let mut alloc = TestAlloc;
        let mut fixups = FixupTable::new();
        let head = list_head();
        unsafe { init_list_head(head, &mut fixups) };

        let mut mappings = MappingSet::new();
        mappings.add(None, PhysAddr::new(0), 256, MemoryKind::Free).unwrap();
        mappings
            .add(
                Some(VirtAddr::new(0xffff_f800_0000_0000)),
                PhysAddr::new(0x20_0000),
                16,
                MemoryKind::SystemCode,
            )
            .unwrap();

        let pages = memory_descriptor_pages(mappings.len());
        let buffer = alloc.alloc_pages(pages).unwrap();
        write_memory_descriptors(&mappings, head, buffer, pages, &mut fixups).unwrap();

        unsafe {
            assert_eq!(list_len(head), 2);
            let mut kinds = Vec::new();
            for_each(head, |link| {
                let descriptor = link;
                let kind = core::ptr::read_unaligned(
                    (descriptor.as_u64() as usize
                        + offset_of!(MemoryAllocationDescriptor, memory_type))
                        as *const u32,
                );
                kinds.push(kind);
            });
            assert_eq!(kinds, [MemoryKind::Free as u32, MemoryKind::SystemCode as u32]);
        }
    }

    #[test]
    fn arc_disk_names_survive_emission() {
        let mut alloc = TestAlloc;
        let mut fixups = FixupTable::new();
        let head = list_head();
        unsafe { init_list_head(head, &mut fixups) };

        let disks = [ArcDiskEntry {
            arc_name: String::from("multi(0)disk(0)rdisk(0)partition(1)"),
            signature: 0xdead_beef,
            check_sum: 1,
            valid_partition_table: true,
            is_gpt: false,
            gpt_signature: [0; 16],
        }];

        let (base, pages) =
            write_arc_disk_list(&disks, head, true, &mut alloc, &mut fixups).unwrap();

        // Map the head page and the entry allocation, then emit.
        let mut mappings = MappingSet::new();
        mappings
            .add(
                Some(VirtAddr::new(0xffff_f800_1000_0000)),
                head,
                1,
                MemoryKind::SystemBlock,
            )
            .unwrap();
        mappings
            .add(
                Some(VirtAddr::new(0xffff_f800_2000_0000)),
                base,
                pages,
                MemoryKind::SystemBlock,
            )
            .unwrap();

        unsafe {
            fixups.emit(&mappings).unwrap();

            // head.flink is now virtual and points into the entry pages.
            let flink = read_usize(head) as u64;
            assert_eq!(flink & 0xffff_ffff_f000_0000, 0xffff_f800_2000_0000);

            // The record's arc_name also became virtual.
            let record = base; // first record at allocation start
            let name_ptr =
                read_usize(record.add(offset_of!(ArcDiskSignature, arc_name) as u64)) as u64;
            assert!(name_ptr > 0xffff_f800_2000_0000);
        }
    }
}
