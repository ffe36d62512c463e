//! The loader store: one contiguous allocation holding the parameter block,
//! its extension, the string region and the satellite records, assembled
//! through the offset table and the fixup registry.

use crate::dispatch::{
    ARC_DISK_REGION, DEBUG_DESCRIPTOR_REGION, EXTENSION_REGION, GRAPHICS_REGION, NLS_REGION,
    PERFORMANCE_REGION, STORE_SIZE, STRINGS_REGION, STRINGS_REGION_SIZE, StoreLayout,
};
use crate::fixups::FixupTable;
use crate::layouts::{
    BgBlock1, BgBlock2, BootGraphicsContextV2, BootGraphicsContextV3, BootGraphicsContextV4,
    CM_RESOURCE_TYPE_MEMORY, DebugDeviceAddress, DebugDeviceDescriptor, ExtApiSet, ExtErrata,
    ExtFirmware, ExtGraphics, ExtHalAndTime, FirmwareInformation, ListEntry,
    MAXIMUM_DEBUG_BARS, STATUS_NOT_IMPLEMENTED, TPM_BOOT_ENTROPY_NO_TPM_FOUND,
    TpmBootEntropyResult,
};
use crate::lists::init_list_head;
use crate::version::Generation;
use crate::{BlockError, KERNEL_STACK_PAGES};
use core::mem::offset_of;
use loader_vmem::{MappingSet, PAGE_SIZE, PageAllocator, PhysAddr, VirtAddr, page_count};
use log::debug;

/// Display parameters for the boot-graphics context.
#[derive(Clone, Debug)]
pub struct BootGraphics {
    pub width: u32,
    pub height: u32,
    pub pixels_per_scan_line: u32,
    pub framebuffer: VirtAddr,
    pub system_font: Option<(VirtAddr, u32)>,
    pub console_font: Option<(VirtAddr, u32)>,
    pub reserve_pool: VirtAddr,
    pub reserve_pool_size: u32,
}

/// The assembled store. Owns its pages until the kernel takes over.
pub struct LoaderStore {
    base: PhysAddr,
    pages: u64,
    layout: StoreLayout,
    pub fixups: FixupTable,
}

impl LoaderStore {
    /// Allocate and pre-initialize the store for the target version: size
    /// and version words, list heads, satellite pointers, and the fields
    /// whose values are version constants.
    pub fn new(
        layout: StoreLayout,
        alloc: &mut dyn PageAllocator,
        cpu_frequency: u64,
        firmware_revision: u32,
    ) -> Result<Self, BlockError> {
        let pages = page_count(STORE_SIZE as u64);
        let base = alloc.alloc_pages(pages).ok_or(BlockError::OutOfMemory)?;

        // SAFETY: fresh exclusive allocation.
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0, (pages * PAGE_SIZE) as usize);
        }

        let mut store = Self {
            base,
            pages,
            layout,
            fixups: FixupTable::new(),
        };
        store.initialize(cpu_frequency, firmware_revision);
        Ok(store)
    }

    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[must_use]
    pub const fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn at(&self, offset: usize) -> PhysAddr {
        self.base.add(offset as u64)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        // SAFETY: every offset comes from the layout tables, all within the
        // store allocation.
        unsafe {
            core::ptr::write_unaligned(self.at(offset).as_u64() as *mut u32, value);
        }
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        unsafe {
            core::ptr::write_unaligned(self.at(offset).as_u64() as *mut u64, value);
        }
    }

    /// Write a pointer-sized field; physical values are registered for the
    /// emission pass, virtual values are final.
    fn write_ptr(&mut self, offset: usize, value: usize, physical: bool) {
        unsafe {
            core::ptr::write_unaligned(self.at(offset).as_u64() as *mut usize, value);
        }
        if physical {
            self.fixups.register(self.at(offset));
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_unaligned(self.at(offset).as_u64() as *const u32) }
    }

    fn init_list(&mut self, offset: usize) {
        let at = self.at(offset);
        unsafe {
            init_list_head(at, &mut self.fixups);
        }
    }

    fn initialize(&mut self, cpu_frequency: u64, firmware_revision: u32) {
        let layout = self.layout.clone();
        let block = &layout.block;
        let ext = &layout.extension;
        let base = EXTENSION_REGION;

        // Block header and fixed scalars.
        if let Some(header) = block.version_header {
            self.write_u32(header, layout.version.major());
            self.write_u32(header + 4, layout.version.minor());
            if let Some(size) = block.size_value {
                self.write_u32(header + 8, size);
            }
            if let Some(oslsv) = block.os_loader_security_version {
                self.write_u32(header + 12, oslsv);
            }
        }

        if let Some(offset) = block.kernel_stack_size {
            self.write_u32(offset, (KERNEL_STACK_PAGES * PAGE_SIZE) as u32);
        }

        // List heads in the block.
        self.init_list(block.lists + offset_of!(crate::layouts::BlockLists, load_order_list_head));
        self.init_list(
            block.lists + offset_of!(crate::layouts::BlockLists, memory_descriptor_list_head),
        );
        self.init_list(
            block.lists + offset_of!(crate::layouts::BlockLists, boot_driver_list_head),
        );
        for offset in [
            block.early_launch_list,
            block.core_driver_list,
            block.core_extensions_list,
            block.tpm_core_list,
        ]
        .into_iter()
        .flatten()
        {
            self.init_list(offset);
        }

        // Firmware information.
        if let Some(firmware) = block.firmware {
            self.write_u32(firmware + offset_of!(FirmwareInformation, firmware_type_flags), 1);
            self.write_u32(
                firmware + offset_of!(FirmwareInformation, firmware_version),
                firmware_revision,
            );
            self.init_list(firmware + offset_of!(FirmwareInformation, firmware_resource_list));
        }

        // The extension pointer and the satellite pointers live in the same
        // allocation; they are physical until emission.
        self.write_ptr(
            block.extension_ptr,
            self.at(EXTENSION_REGION).as_u64() as usize,
            true,
        );
        self.write_ptr(
            block.paths + offset_of!(crate::layouts::BlockPaths, nls_data),
            self.at(NLS_REGION).as_u64() as usize,
            true,
        );
        self.write_ptr(
            block.paths + offset_of!(crate::layouts::BlockPaths, arc_disk_information),
            self.at(ARC_DISK_REGION).as_u64() as usize,
            true,
        );
        self.init_list(ARC_DISK_REGION);

        // Extension head.
        self.write_u32(base, ext.size_value);
        self.write_u32(base + ext.profile, 2); // Profile.Status = DOCK_STATE_UNKNOWN
        if let Some(offset) = ext.major_minor {
            self.write_u32(base + offset, layout.version.major());
            self.write_u32(base + offset + 4, layout.version.minor());
        }

        self.init_list(base + ext.firmware + offset_of!(ExtFirmware, firmware_descriptor_list_head));
        // The reference loaders hand the kernel a bogus non-null ACPI table
        // pointer here; kernels in the supported range never read it.
        self.write_ptr(
            base + ext.firmware + offset_of!(ExtFirmware, acpi_table),
            1,
            false,
        );

        if let Some(offset) = ext.persistent {
            self.init_list(base + offset);
        }
        if let Some(offset) = ext.graphics {
            self.init_list(base + offset + offset_of!(ExtGraphics, attached_hives));
        }
        if let Some(offset) = ext.hal_and_time {
            self.init_list(base + offset + offset_of!(ExtHalAndTime, hal_extension_module_list));
        }
        if let Some(offset) = ext.api_set {
            self.init_list(base + offset + offset_of!(ExtApiSet, api_set_schema_extensions));
        }

        if let Some(offset) = ext.loader_performance_data {
            self.write_ptr(
                base + offset,
                self.at(PERFORMANCE_REGION).as_u64() as usize,
                true,
            );
        }

        if let Some(offset) = ext.boot_entropy {
            self.write_u32(base + offset, layout.version.max_entropy_sources().unwrap_or(0));
        }
        if let Some(offset) = ext.tpm_entropy {
            self.write_u32(
                base + offset + offset_of!(TpmBootEntropyResult, result_code),
                TPM_BOOT_ENTROPY_NO_TPM_FOUND,
            );
            self.write_u32(
                base + offset + offset_of!(TpmBootEntropyResult, result_status),
                STATUS_NOT_IMPLEMENTED as u32,
            );
        }
        if let Some(offset) = ext.processor_counter_frequency {
            self.write_u64(base + offset, cpu_frequency);
        }
        if let Some((offset, value)) = ext.major_release {
            self.write_u32(base + offset, value);
        }

        debug!(
            "loader store initialized for {:?} ({} pages)",
            layout.version.generation, self.pages
        );
    }

    /// Lay the five NUL-terminated strings into the string region and point
    /// the block at them: ARC boot device, ARC HAL device, NT boot path
    /// (leading and trailing backslash), NT HAL path, load options.
    pub fn set_strings(
        &mut self,
        arc_name: &str,
        system_path: &str,
        options: &str,
    ) -> Result<(), BlockError> {
        let needed = arc_name.len() * 2 + system_path.len() + options.len() + 16;
        if needed > STRINGS_REGION_SIZE {
            return Err(BlockError::StringRegionFull);
        }

        let paths = self.layout.block.paths;
        let mut cursor = STRINGS_REGION;

        let mut emit = |store: &mut Self, text: &[&str], field: usize| {
            let at = cursor;
            for part in text {
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        part.as_ptr(),
                        store.at(cursor).as_u64() as *mut u8,
                        part.len(),
                    );
                }
                cursor += part.len();
            }
            unsafe {
                *(store.at(cursor).as_u64() as *mut u8) = 0;
            }
            cursor += 1;
            store.write_ptr(paths + field, store.at(at).as_u64() as usize, true);
        };

        use crate::layouts::BlockPaths;
        emit(self, &[arc_name], offset_of!(BlockPaths, arc_boot_device_name));
        emit(self, &[arc_name], offset_of!(BlockPaths, arc_hal_device_name));

        let trailing = if system_path.ends_with('\\') { "" } else { "\\" };
        emit(
            self,
            &["\\", system_path, trailing],
            offset_of!(BlockPaths, nt_boot_path_name),
        );
        emit(self, &["\\"], offset_of!(BlockPaths, nt_hal_path_name));
        emit(self, &[options], offset_of!(BlockPaths, load_options));

        Ok(())
    }

    pub fn set_registry(&mut self, base_va: VirtAddr, length: u32) {
        let block = self.layout.block.clone();
        self.write_u32(block.registry_length, length);
        self.write_ptr(block.registry_base, base_va.as_u64() as usize, false);
    }

    pub fn set_kernel_stack(&mut self, stack_va: VirtAddr) {
        let threads = self.layout.block.threads;
        self.write_ptr(
            threads + offset_of!(crate::layouts::BlockThreads, kernel_stack),
            stack_va.as_u64() as usize,
            false,
        );
    }

    pub fn set_prcb(&mut self, prcb_va: VirtAddr) {
        let threads = self.layout.block.threads;
        self.write_ptr(
            threads + offset_of!(crate::layouts::BlockThreads, prcb),
            prcb_va.as_u64() as usize,
            false,
        );
    }

    /// NLS table pointers (already virtual).
    pub fn set_nls(&mut self, ansi: VirtAddr, oem: VirtAddr, case_table: VirtAddr) {
        use crate::layouts::NlsDataBlock;
        self.write_ptr(
            NLS_REGION + offset_of!(NlsDataBlock, ansi_code_page_data),
            ansi.as_u64() as usize,
            false,
        );
        self.write_ptr(
            NLS_REGION + offset_of!(NlsDataBlock, oem_code_page_data),
            oem.as_u64() as usize,
            false,
        );
        self.write_ptr(
            NLS_REGION + offset_of!(NlsDataBlock, unicode_case_table_data),
            case_table.as_u64() as usize,
            false,
        );
    }

    pub fn set_errata(&mut self, image: VirtAddr, size: u32) {
        let at = EXTENSION_REGION + self.layout.extension.errata;
        self.write_ptr(
            at + offset_of!(ExtErrata, em_inf_file_image),
            image.as_u64() as usize,
            false,
        );
        self.write_u32(at + offset_of!(ExtErrata, em_inf_file_size), size);
    }

    pub fn set_drvdb(&mut self, image: VirtAddr, size: u32) {
        use crate::layouts::ExtDrvDb;
        let at = EXTENSION_REGION + self.layout.extension.drvdb;
        self.write_ptr(
            at + offset_of!(ExtDrvDb, drvdb_image),
            image.as_u64() as usize,
            false,
        );
        self.write_u32(at + offset_of!(ExtDrvDb, drvdb_size), size);
    }

    /// API-set schema blob (8.1 and later; Win8 kernels find it by image).
    pub fn set_api_set_schema(&mut self, schema: VirtAddr, size: u32) {
        let Some(offset) = self.layout.extension.api_set else {
            return;
        };
        let at = EXTENSION_REGION + offset;
        self.write_ptr(
            at + offset_of!(ExtApiSet, api_set_schema),
            schema.as_u64() as usize,
            false,
        );
        self.write_u32(at + offset_of!(ExtApiSet, api_set_schema_size), size);
    }

    /// RTC time in NT ticks, stamped into the Win8+ extension.
    pub fn set_system_time(&mut self, nt_time: i64) {
        let Some(offset) = self.layout.extension.hal_and_time else {
            return;
        };
        let at = EXTENSION_REGION + offset;
        self.write_u64(at + offset_of!(ExtHalAndTime, system_time), nt_time as u64);
        self.write_u64(at + offset_of!(ExtHalAndTime, dbg_rtc_boot_time), 1);
    }

    pub fn set_loader_pages_spanned(&mut self, pages: u64) {
        let Some(offset) = self.layout.extension.loader_pages_spanned else {
            return;
        };
        self.write_ptr(EXTENSION_REGION + offset, pages as usize, false);
    }

    /// Virtual address of the firmware's `GetTime` slot; physical until the
    /// emission pass.
    pub fn set_virtual_efi_runtime_services(&mut self, get_time_slot: PhysAddr) {
        let Some(firmware) = self.layout.block.firmware else {
            return;
        };
        self.write_ptr(
            firmware + offset_of!(FirmwareInformation, virtual_efi_runtime_services),
            get_time_slot.as_u64() as usize,
            true,
        );
    }

    /// The preserved EFI memory map (8.1 and later).
    pub fn set_efi_memory_map(&mut self, map: PhysAddr, size: u32, descriptor_size: u32) {
        if !matches!(
            self.layout.version.generation,
            Generation::Win81 | Generation::Win10
        ) {
            return;
        }
        let Some(firmware) = self.layout.block.firmware else {
            return;
        };
        self.write_ptr(
            firmware + offset_of!(FirmwareInformation, efi_memory_map),
            map.as_u64() as usize,
            true,
        );
        self.write_u32(
            firmware + offset_of!(FirmwareInformation, efi_memory_map_size),
            size,
        );
        self.write_u32(
            firmware + offset_of!(FirmwareInformation, efi_memory_map_descriptor_size),
            descriptor_size,
        );
    }

    pub fn set_configuration_root(&mut self, root: PhysAddr) {
        let paths = self.layout.block.paths;
        self.write_ptr(
            paths + offset_of!(crate::layouts::BlockPaths, configuration_root),
            root.as_u64() as usize,
            true,
        );
    }

    /// Copy the debug device descriptor into the store and hook it up; only
    /// called when KDNET initialized successfully.
    pub fn set_kd_debug_device(&mut self, descriptor: &DebugDeviceDescriptor) {
        let Some(offset) = self.layout.extension.kd_debug_device else {
            return;
        };

        unsafe {
            core::ptr::copy_nonoverlapping(
                core::ptr::from_ref(descriptor).cast::<u8>(),
                self.at(DEBUG_DESCRIPTOR_REGION).as_u64() as *mut u8,
                size_of::<DebugDeviceDescriptor>(),
            );
        }

        self.write_ptr(
            EXTENSION_REGION + offset,
            self.at(DEBUG_DESCRIPTOR_REGION).as_u64() as usize,
            true,
        );

        // MMIO BARs and the transport scratch buffer are physical pointers
        // the kernel dereferences; they get mapped and therefore fixed up.
        for i in 0..MAXIMUM_DEBUG_BARS {
            let bar = DEBUG_DESCRIPTOR_REGION
                + offset_of!(DebugDeviceDescriptor, base_address)
                + i * size_of::<DebugDeviceAddress>();
            let valid = descriptor.base_address[i].valid != 0;
            let is_memory = descriptor.base_address[i].address_type == CM_RESOURCE_TYPE_MEMORY;
            if valid && is_memory {
                self.fixups
                    .register(self.at(bar + offset_of!(DebugDeviceAddress, translated_address)));
            }
        }
        if descriptor.memory.virtual_address != 0 {
            self.fixups.register(self.at(
                DEBUG_DESCRIPTOR_REGION
                    + offset_of!(DebugDeviceDescriptor, memory)
                    + offset_of!(crate::layouts::DebugMemoryRequirements, virtual_address),
            ));
        }
    }

    /// Fill the boot-graphics context and point the extension at it.
    pub fn set_boot_graphics(&mut self, graphics: &BootGraphics) {
        let Some(bg_version) = self.layout.version.boot_graphics_version() else {
            return;
        };
        let Some(ext_graphics) = self.layout.extension.graphics else {
            return;
        };

        let block2_offset = match bg_version {
            1 => size_of::<BgBlock1>(),
            2 => offset_of!(BootGraphicsContextV2, block2),
            3 => offset_of!(BootGraphicsContextV3, block2),
            _ => offset_of!(BootGraphicsContextV4, block2),
        };

        let b1 = GRAPHICS_REGION;
        self.write_u32(b1 + offset_of!(BgBlock1, version), u32::from(bg_version));
        let internal = b1 + offset_of!(BgBlock1, internal);
        use crate::layouts::BgInternal;
        self.write_u32(internal + offset_of!(BgInternal, mode), 1);
        self.write_u32(internal + offset_of!(BgInternal, attached), 1);
        self.write_u32(internal + offset_of!(BgInternal, display_type), 0xc4);
        self.write_u32(internal + offset_of!(BgInternal, width), graphics.width);
        self.write_u32(internal + offset_of!(BgInternal, height), graphics.height);
        self.write_u32(
            internal + offset_of!(BgInternal, pixels_per_scan_line),
            graphics.pixels_per_scan_line,
        );
        // 5 = 32-bit BGRX, the only format the GOP path selects.
        self.write_u32(internal + offset_of!(BgInternal, pixel_format), 5);
        self.write_u32(internal + offset_of!(BgInternal, bits_per_pixel), 32);
        self.write_ptr(
            internal + offset_of!(BgInternal, framebuffer),
            graphics.framebuffer.as_u64() as usize,
            false,
        );

        if let Some((font, size)) = graphics.system_font {
            self.write_ptr(
                b1 + offset_of!(BgBlock1, system_font),
                font.as_u64() as usize,
                false,
            );
            self.write_u32(b1 + offset_of!(BgBlock1, system_font_size), size);
        }
        if let Some((font, size)) = graphics.console_font {
            self.write_ptr(
                b1 + offset_of!(BgBlock1, console_font),
                font.as_u64() as usize,
                false,
            );
            self.write_u32(b1 + offset_of!(BgBlock1, console_font_size), size);
        }

        let b2 = GRAPHICS_REGION + block2_offset;
        self.write_ptr(
            b2 + offset_of!(BgBlock2, reserve_pool),
            graphics.reserve_pool.as_u64() as usize,
            false,
        );
        self.write_u32(
            b2 + offset_of!(BgBlock2, reserve_pool_size),
            graphics.reserve_pool_size,
        );

        self.write_ptr(
            EXTENSION_REGION + ext_graphics + offset_of!(ExtGraphics, bg_context),
            self.at(GRAPHICS_REGION).as_u64() as usize,
            true,
        );
    }

    // List-head addresses for the external emitters.

    #[must_use]
    pub fn load_order_list_head(&self) -> PhysAddr {
        self.at(self.layout.block.lists
            + offset_of!(crate::layouts::BlockLists, load_order_list_head))
    }

    #[must_use]
    pub fn memory_descriptor_list_head(&self) -> PhysAddr {
        self.at(self.layout.block.lists
            + offset_of!(crate::layouts::BlockLists, memory_descriptor_list_head))
    }

    #[must_use]
    pub fn boot_driver_list_head(&self) -> PhysAddr {
        self.at(self.layout.block.lists
            + offset_of!(crate::layouts::BlockLists, boot_driver_list_head))
    }

    #[must_use]
    pub fn core_driver_list_head(&self) -> Option<PhysAddr> {
        self.layout.block.core_driver_list.map(|o| self.at(o))
    }

    #[must_use]
    pub fn arc_disk_list_head(&self) -> PhysAddr {
        self.at(ARC_DISK_REGION)
    }

    /// Size value the extension advertises (test hook and sanity logging).
    #[must_use]
    pub fn extension_size(&self) -> u32 {
        self.read_u32(EXTENSION_REGION)
    }

    /// Rewrite every registered pointer slot to its virtual address.
    ///
    /// # Safety
    /// All registered allocations must still be identity-mapped.
    pub unsafe fn emit(&self, mappings: &MappingSet) -> Result<usize, crate::fixups::EmitError> {
        unsafe { self.fixups.emit(mappings) }
    }
}

const _: () = assert!(STORE_SIZE < 64 * 4096, "store must stay a small allocation");
const _: () = assert!(size_of::<ListEntry>() == 2 * size_of::<usize>());
