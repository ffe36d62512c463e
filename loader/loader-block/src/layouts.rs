//! The version-parameterized `LOADER_PARAMETER_BLOCK` / `EXTENSION` family
//! and the satellite records embedded in the loader store.
//!
//! Field widths follow the native pointer size, the same way the kernel's
//! own headers do: an x86 build of this crate lays the structures out for
//! x86 kernels, an x86-64 build for x86-64 kernels. The structures are
//! never instantiated wholesale; assembly goes through the offset table in
//! [`crate::dispatch`], and fields the target kernel does not read stay
//! zero.

#![allow(dead_code)]

use core::mem::offset_of;

/// `LIST_ENTRY`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ListEntry {
    pub flink: usize,
    pub blink: usize,
}

/// `UNICODE_STRING`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct UnicodeString {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: usize,
}

/// `PROFILE_PARAMETER_BLOCK`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct ProfileParameterBlock {
    pub status: u32,
    pub reserved: u32,
    pub docking_state: u32,
    pub capabilities: u32,
    pub dock_id: u32,
    pub serial_number: u32,
}

/// `NLS_DATA_BLOCK`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct NlsDataBlock {
    pub ansi_code_page_data: usize,
    pub oem_code_page_data: usize,
    pub unicode_case_table_data: usize,
}

/// `ARC_DISK_INFORMATION`.
#[repr(C)]
pub struct ArcDiskInformation {
    pub disk_signature_list_head: ListEntry,
}

/// `ARC_DISK_SIGNATURE` as read by kernels before Win7 (and pre-SP2 Vista).
#[repr(C)]
pub struct ArcDiskSignature {
    pub list_entry: ListEntry,
    pub signature: u32,
    pub arc_name: usize,
    pub check_sum: u32,
    pub valid_partition_table: u8,
    pub x_int13: u8,
    pub reserved: [u8; 2],
}

/// `ARC_DISK_SIGNATURE` with the GPT tail (Vista SP2 / Win7 and later).
#[repr(C)]
pub struct ArcDiskSignatureWin7 {
    pub list_entry: ListEntry,
    pub signature: u32,
    pub arc_name: usize,
    pub check_sum: u32,
    pub valid_partition_table: u8,
    pub x_int13: u8,
    pub is_gpt: u8,
    pub reserved: u8,
    pub gpt_signature: [u8; 16],
}

/// `LOADER_PERFORMANCE_DATA`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct LoaderPerformanceData {
    pub start_time: u64,
    pub end_time: u64,
    pub preload_end_time: u64,
    pub tcb_loader_start_time: u64,
    pub load_hypervisor_time: u64,
    pub launch_hypervisor_time: u64,
    pub resume_count: u64,
    pub resume_time: u64,
}

/// `KLDR_DATA_TABLE_ENTRY`. `entry_flags` carries the packed booleans the
/// loader owns (`EntryProcessed`, `DontRelocate`).
#[repr(C)]
pub struct KldrDataTableEntry {
    pub in_load_order_links: ListEntry,
    pub exception_table: usize,
    pub exception_table_size: u32,
    pub pad0: u32,
    pub gp_value: usize,
    pub non_paged_debug_info: usize,
    pub dll_base: usize,
    pub entry_point: usize,
    pub size_of_image: u32,
    pub pad1: u32,
    pub full_dll_name: UnicodeString,
    pub base_dll_name: UnicodeString,
    pub flags: u32,
    pub load_count: u16,
    pub entry_flags: u16,
    pub section_pointer: usize,
    pub check_sum: u32,
    pub coverage_section_size: u32,
    pub coverage_section: usize,
    pub loaded_imports: usize,
    pub spare: [usize; 2],
}

/// `KldrDataTableEntry::flags` bit: a DLL pulled in by a boot driver.
pub const LDRP_DRIVER_DEPENDENT_DLL: u32 = 0x0400_0000;
/// `KldrDataTableEntry::flags` bit: `IMAGE_DLLCHARACTERISTICS_FORCE_INTEGRITY`.
pub const LDRP_IMAGE_INTEGRITY_FORCED: u32 = 0x0000_0020;
/// `entry_flags` bit: processed by the loader.
pub const LDRE_ENTRY_PROCESSED: u16 = 0x0001;
/// `entry_flags` bit: the kernel must not rebase this image.
pub const LDRE_DONT_RELOCATE: u16 = 0x0020;

/// `BOOT_DRIVER_LIST_ENTRY`.
#[repr(C)]
pub struct BootDriverListEntry {
    pub link: ListEntry,
    pub file_path: UnicodeString,
    pub registry_path: UnicodeString,
    pub ldr_entry: usize,
}

/// `CONFIGURATION_COMPONENT` (embedded in the tree node).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigurationComponent {
    pub class: u32,
    pub component_type: u32,
    pub flags: u32,
    pub version: u16,
    pub revision: u16,
    pub key: u32,
    pub affinity_mask: u32,
    pub configuration_data_length: u32,
    pub identifier_length: u32,
}

/// `CONFIGURATION_COMPONENT_DATA`, the ARC hardware-tree node.
#[repr(C)]
pub struct ConfigurationComponentData {
    pub parent: usize,
    pub child: usize,
    pub sibling: usize,
    pub component_entry: ConfigurationComponent,
    pub identifier: usize,
    pub configuration_data: usize,
}

pub const MAXIMUM_DEBUG_BARS: usize = 6;

/// One BAR of the debug device.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugDeviceAddress {
    pub address_type: u8,
    pub valid: u8,
    pub access_size: u8,
    pub bit_width: u8,
    pub translated_address: usize,
    pub length: u32,
    pub pad: u32,
}

/// Contiguous memory owned by the debug transport.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugMemoryRequirements {
    pub start: u64,
    pub max_end: u64,
    pub virtual_address: usize,
    pub length: u32,
    pub cached: u8,
    pub aligned: u8,
    pub pad: [u8; 2],
}

/// `DEBUG_DEVICE_DESCRIPTOR` as consumed by `kdnet.dll` and the kernel.
#[repr(C)]
pub struct DebugDeviceDescriptor {
    pub bus: u32,
    pub slot: u32,
    pub segment: u16,
    pub vendor_id: u16,
    pub device_id: u16,
    pub base_class: u8,
    pub sub_class: u8,
    pub prog_if: u8,
    pub flags: u8,
    pub initialized: u8,
    pub configured: u8,
    pub base_address: [DebugDeviceAddress; MAXIMUM_DEBUG_BARS],
    pub memory: DebugMemoryRequirements,
    pub port_type: u16,
    pub port_subtype: u16,
    pub pad: u32,
    pub oem_data: usize,
    pub oem_data_length: u32,
    pub name_space: u32,
    pub name_space_path: usize,
    pub name_space_path_length: u32,
    pub transport_type: u32,
    pub transport_data: DebugTransportData,
}

/// `TransportData` tail of the descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugTransportData {
    pub hw_context_size: u32,
    pub use_serial_framing: u8,
    pub pad: [u8; 3],
}

/// Resource tag of a memory-space BAR.
pub const CM_RESOURCE_TYPE_MEMORY: u8 = 3;

// ---------------------------------------------------------------------------
// Boot graphics context
// ---------------------------------------------------------------------------

/// Display state shared by every context revision.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct BgInternal {
    pub mode: u32,
    pub attached: u32,
    pub reserved0: u32,
    pub display_type: u32,
    pub width: u32,
    pub height: u32,
    pub pixels_per_scan_line: u32,
    pub pixel_format: u32,
    pub bits_per_pixel: u32,
    pub pad: u32,
    pub framebuffer: usize,
}

/// Head of every `BOOT_GRAPHICS_CONTEXT` revision.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct BgBlock1 {
    pub version: u32,
    pub pad: u32,
    pub internal: BgInternal,
    pub system_font: usize,
    pub system_font_size: u32,
    pub pad2: u32,
    pub console_font: usize,
    pub console_font_size: u32,
    pub pad3: u32,
}

/// Reserve-pool tail shared by every revision.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct BgBlock2 {
    pub reserve_pool: usize,
    pub reserve_pool_size: u32,
    pub pad: u32,
}

#[repr(C)]
pub struct BootGraphicsContextV1 {
    pub block1: BgBlock1,
    pub block2: BgBlock2,
}

#[repr(C)]
pub struct BootGraphicsContextV2 {
    pub block1: BgBlock1,
    pub reserved: [usize; 2],
    pub block2: BgBlock2,
}

#[repr(C)]
pub struct BootGraphicsContextV3 {
    pub block1: BgBlock1,
    pub reserved: [usize; 4],
    pub block2: BgBlock2,
}

#[repr(C)]
pub struct BootGraphicsContextV4 {
    pub block1: BgBlock1,
    pub reserved: [usize; 6],
    pub block2: BgBlock2,
}

// ---------------------------------------------------------------------------
// Loader parameter blocks
// ---------------------------------------------------------------------------

/// The three list heads every generation starts its list area with.
#[repr(C)]
pub struct BlockLists {
    pub load_order_list_head: ListEntry,
    pub memory_descriptor_list_head: ListEntry,
    pub boot_driver_list_head: ListEntry,
}

/// The kernel-thread bootstrap pointers.
#[repr(C)]
pub struct BlockThreads {
    pub kernel_stack: usize,
    pub prcb: usize,
    pub process: usize,
    pub thread: usize,
}

/// The ARC path / NLS / disk tail shared by every generation.
#[repr(C)]
pub struct BlockPaths {
    pub configuration_root: usize,
    pub arc_boot_device_name: usize,
    pub arc_hal_device_name: usize,
    pub nt_boot_path_name: usize,
    pub nt_hal_path_name: usize,
    pub load_options: usize,
    pub nls_data: usize,
    pub arc_disk_information: usize,
}

/// Machine-specific union tail (`u.I386`).
#[repr(C)]
pub struct BlockArch {
    pub common_data_area: usize,
    pub machine_type: u32,
    pub virtual_bias: u32,
}

/// `FIRMWARE_INFORMATION_LOADER_BLOCK` (EFI side of the union).
#[repr(C)]
pub struct FirmwareInformation {
    /// Bit 0: firmware is EFI.
    pub firmware_type_flags: u32,
    pub reserved: u32,
    pub firmware_version: u32,
    pub pad0: u32,
    pub virtual_efi_runtime_services: usize,
    pub firmware_resource_list: ListEntry,
    pub efi_memory_map: usize,
    pub efi_memory_map_size: u32,
    pub efi_memory_map_descriptor_size: u32,
}

/// Windows Server 2003.
#[repr(C)]
pub struct LoaderBlockWs03 {
    pub lists: BlockLists,
    pub threads: BlockThreads,
    pub registry_length: u32,
    pub pad0: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
}

/// Windows Vista. Same shape as WS03 plus the firmware union.
#[repr(C)]
pub struct LoaderBlockVista {
    pub lists: BlockLists,
    pub threads: BlockThreads,
    pub registry_length: u32,
    pub pad0: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
    pub firmware_information: FirmwareInformation,
}

/// Windows 7: the version header appears in front.
#[repr(C)]
pub struct LoaderBlockWin7 {
    pub os_major_version: u32,
    pub os_minor_version: u32,
    pub size: u32,
    pub os_loader_security_version: u32,
    pub lists: BlockLists,
    pub threads: BlockThreads,
    pub registry_length: u32,
    pub pad0: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
    pub firmware_information: FirmwareInformation,
}

/// Windows 8: early-launch and core-driver lists, `KernelStackSize`.
#[repr(C)]
pub struct LoaderBlockWin8 {
    pub os_major_version: u32,
    pub os_minor_version: u32,
    pub size: u32,
    pub os_loader_security_version: u32,
    pub lists: BlockLists,
    pub early_launch_list_head: ListEntry,
    pub core_driver_list_head: ListEntry,
    pub threads: BlockThreads,
    pub kernel_stack_size: u32,
    pub registry_length: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
    pub firmware_information: FirmwareInformation,
}

/// Windows 8.1: identical composition to Win8 (the deltas live in the
/// extension).
#[repr(C)]
pub struct LoaderBlockWin81 {
    pub os_major_version: u32,
    pub os_minor_version: u32,
    pub size: u32,
    pub os_loader_security_version: u32,
    pub lists: BlockLists,
    pub early_launch_list_head: ListEntry,
    pub core_driver_list_head: ListEntry,
    pub threads: BlockThreads,
    pub kernel_stack_size: u32,
    pub registry_length: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
    pub firmware_information: FirmwareInformation,
}

/// Windows 10: two more driver lists and the boot-stat path tail (the
/// `Size` value fences the tail off before 1803).
#[repr(C)]
pub struct LoaderBlockWin10 {
    pub os_major_version: u32,
    pub os_minor_version: u32,
    pub size: u32,
    pub os_loader_security_version: u32,
    pub lists: BlockLists,
    pub early_launch_list_head: ListEntry,
    pub core_driver_list_head: ListEntry,
    pub core_extensions_driver_list_head: ListEntry,
    pub tpm_core_driver_list_head: ListEntry,
    pub threads: BlockThreads,
    pub kernel_stack_size: u32,
    pub registry_length: u32,
    pub registry_base: usize,
    pub paths: BlockPaths,
    pub oem_font_file: usize,
    pub setup_loader_block: usize,
    pub extension: usize,
    pub arch: BlockArch,
    pub firmware_information: FirmwareInformation,
    pub os_bootstat_path_name: usize,
    pub arc_os_data_device_name: usize,
    pub arc_windows_sys_part_name: usize,
}

impl LoaderBlockWin10 {
    /// `Size` reported to kernels older than 1803, which fence off the
    /// boot-stat tail.
    #[must_use]
    pub const fn size_before_1803() -> u32 {
        offset_of!(Self, os_bootstat_path_name) as u32
    }
}

// ---------------------------------------------------------------------------
// Loader parameter extensions
// ---------------------------------------------------------------------------

/// Head shared by every extension generation.
#[repr(C)]
pub struct ExtHead {
    pub size: u32,
    pub profile: ProfileParameterBlock,
    pub pad: u32,
}

/// Errata-INF fields (`EmInfFileImage`/`EmInfFileSize`).
#[repr(C)]
pub struct ExtErrata {
    pub em_inf_file_image: usize,
    pub em_inf_file_size: u32,
    pub pad: u32,
}

/// Driver-database fields (`DrvDBImage`/`DrvDBSize`).
#[repr(C)]
pub struct ExtDrvDb {
    pub drvdb_image: usize,
    pub drvdb_size: u32,
    pub pad: u32,
}

/// Firmware descriptor list and the ACPI table pointer.
#[repr(C)]
pub struct ExtFirmware {
    pub firmware_descriptor_list_head: ListEntry,
    pub acpi_table: usize,
    pub acpi_table_size: u32,
    pub boot_flags: u32,
}

/// Boot-application persistent data (Vista SP2 and later).
#[repr(C)]
pub struct ExtPersistent {
    pub boot_application_persistent_data: ListEntry,
}

/// Boot graphics pointer plus the attached-hive list (Win7 and later).
#[repr(C)]
pub struct ExtGraphics {
    pub bg_context: usize,
    pub numa_locality_info: usize,
    pub numa_group_assignment: usize,
    pub attached_hives: ListEntry,
    pub memory_caching_requirements_count: u32,
    pub pad: u32,
    pub memory_caching_requirements: usize,
}

/// HAL extensions and the firmware clock snapshot (Win8 and later).
#[repr(C)]
pub struct ExtHalAndTime {
    pub hal_extension_module_list: ListEntry,
    pub system_time: i64,
    pub time_stamp_at_system_time_read: u64,
    /// Nonzero when `SystemTime` really came from the RTC.
    pub dbg_rtc_boot_time: u64,
    pub internal_boot_flags: u64,
}

/// API-set schema fields (Win8.1 and later).
#[repr(C)]
pub struct ExtApiSet {
    pub api_set_schema: usize,
    pub api_set_schema_size: u32,
    pub pad: u32,
    pub api_set_schema_extensions: ListEntry,
}

/// `TPM_BOOT_ENTROPY_LDR_RESULT` (Win7 only).
#[repr(C)]
pub struct TpmBootEntropyResult {
    pub policy: u64,
    pub result_code: u32,
    pub result_status: i32,
    pub time: u64,
    pub entropy_length: u32,
    pub entropy_data: [u8; 40],
    pub pad: u32,
}

pub const TPM_BOOT_ENTROPY_NO_TPM_FOUND: u32 = 3;
pub const STATUS_NOT_IMPLEMENTED: i32 = 0xc000_0002u32 as i32;

/// One entropy source result inside `BOOT_ENTROPY_LDR_RESULT`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BootEntropySourceResult {
    pub source_id: u32,
    pub pad: u32,
    pub policy: u64,
    pub result_code: u32,
    pub result_status: i32,
    pub time: u64,
    pub entropy_length: u32,
    pub entropy_data: [u8; 64],
    pub pad2: u32,
}

/// `BOOT_ENTROPY_LDR_RESULT`, parameterized by the per-release source count.
#[repr(C)]
pub struct BootEntropyResult<const N: usize> {
    pub max_entropy_sources: u32,
    pub pad: u32,
    pub entropy_source_result: [BootEntropySourceResult; N],
    pub seed_bytes_for_cng: [u8; 48],
    pub rng_bytes_for_ntoskrnl: [u8; 1024],
}

/// Windows Server 2003.
#[repr(C)]
pub struct ExtensionWs03 {
    pub head: ExtHead,
    pub major_version: u32,
    pub minor_version: u32,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub loader_pages_spanned: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
}

/// Windows Vista RTM/SP1.
#[repr(C)]
pub struct ExtensionVista {
    pub head: ExtHead,
    pub major_version: u32,
    pub minor_version: u32,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub loader_pages_spanned: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
}

/// Windows Vista SP2 (build 6002) appends the boot-graphics pointer.
#[repr(C)]
pub struct ExtensionVistaSp2 {
    pub head: ExtHead,
    pub major_version: u32,
    pub minor_version: u32,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub loader_pages_spanned: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
    pub bg_context: usize,
}

/// Windows 7.
#[repr(C)]
pub struct ExtensionWin7 {
    pub head: ExtHead,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub loader_pages_spanned: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
    pub graphics: ExtGraphics,
    pub tpm_boot_entropy_result: TpmBootEntropyResult,
    pub processor_counter_frequency: u64,
}

/// Windows 8.
#[repr(C)]
pub struct ExtensionWin8 {
    pub head: ExtHead,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
    pub graphics: ExtGraphics,
    pub boot_entropy_result: BootEntropyResult<7>,
    pub processor_counter_frequency: u64,
    pub hypervisor_extension: [u8; 40],
    pub hardware_configuration_id: [u8; 16],
    pub hal_and_time: ExtHalAndTime,
    pub wfs_fp_data: usize,
    pub wfs_fp_data_size: u32,
    pub pad2: u32,
}

/// Windows 8.1. The tail from `offline_crashdump_configuration_table` on is
/// only acknowledged by revisions ≥ 18438 (`Size` fences it off earlier).
#[repr(C)]
pub struct ExtensionWin81 {
    pub head: ExtHead,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
    pub graphics: ExtGraphics,
    pub boot_entropy_result: BootEntropyResult<8>,
    pub processor_counter_frequency: u64,
    pub hypervisor_extension: [u8; 40],
    pub hardware_configuration_id: [u8; 16],
    pub hal_and_time: ExtHalAndTime,
    pub wfs_fp_data: usize,
    pub wfs_fp_data_size: u32,
    pub pad2: u32,
    pub bugcheck_parameters: [usize; 5],
    pub api_set: ExtApiSet,
    pub acpi_bios_version: UnicodeString,
    pub smbios_version: UnicodeString,
    pub efi_version: UnicodeString,
    pub kd_debug_device: usize,
    pub offline_crashdump_configuration_table: [u8; 32],
}

impl ExtensionWin81 {
    /// `Size` reported to revisions before 18438.
    #[must_use]
    pub const fn size_before_18438() -> u32 {
        offset_of!(Self, offline_crashdump_configuration_table) as u32
    }
}

/// Revision where the 8.1 servicing stream grew the extension tail.
pub const WIN81_REVISION_GROWN_TAIL: u16 = 18438;

/// Windows 10 family: one composition, parameterized by the entropy-source
/// count, with the 1607+/1703+ tail fields appended in order. `Size`
/// fencing picks the portion the target build knows.
#[repr(C)]
pub struct ExtensionWin10<const ENTROPY: usize> {
    pub head: ExtHead,
    pub errata: ExtErrata,
    pub triage_dump_block: usize,
    pub headless_loader_block: usize,
    pub smbios_eps_header: usize,
    pub drvdb: ExtDrvDb,
    pub network_loader_block: usize,
    pub firmware: ExtFirmware,
    pub loader_performance_data: usize,
    pub persistent: ExtPersistent,
    pub wmd_test_result: usize,
    pub boot_identifier: [u8; 16],
    pub resume_pages: u32,
    pub pad_tail: u32,
    pub dump_header: usize,
    pub graphics: ExtGraphics,
    pub boot_entropy_result: BootEntropyResult<ENTROPY>,
    pub processor_counter_frequency: u64,
    pub hypervisor_extension: [u8; 40],
    pub hardware_configuration_id: [u8; 16],
    pub hal_and_time: ExtHalAndTime,
    pub wfs_fp_data: usize,
    pub wfs_fp_data_size: u32,
    pub pad2: u32,
    pub bugcheck_parameters: [usize; 5],
    pub api_set: ExtApiSet,
    pub acpi_bios_version: UnicodeString,
    pub smbios_version: UnicodeString,
    pub efi_version: UnicodeString,
    pub kd_debug_device: usize,
    pub offline_crashdump_configuration_table: [u8; 32],
    pub manufacturing_profile: UnicodeString,
    pub bbt_buffer: usize,
    pub xsave_allowed_features: u64,
    pub xsave_flags: u32,
    pub system_hive_recovery_info: [u32; 5],
    /// End of the 1507 layout (`Size` for builds before 1511).
    pub soft_restart_count: u32,
    pub soft_restart_time: i64,
    pub hypercall_code_va: usize,
    pub hal_virtual_address: usize,
    pub hal_number_of_bytes: u64,
    /// 1607: the `MajorRelease` token and leap-second data.
    pub major_release: u32,
    pub reserved1: u32,
    pub leap_seconds: [u8; 24],
    /// End of the 1703 layout as shipped before 1803.
    pub max_pci_bus_number: u32,
    pub feature_settings: u32,
    pub hot_patch_reserve_size: u32,
    pub retpoline_reserve_size: u32,
    pub mini_ex_loader_block: usize,
    pub hypervisor_crashdump_area_page_count: u64,
    /// Tail growth of the 1809 servicing stream; zero is acceptable.
    pub reserved_rs5: [u8; 24],
    /// Tail growth of 1903/1909; zero is acceptable.
    pub reserved_19h1: [u8; 24],
    /// Tail growth of 2004 through 21H1; zero is acceptable.
    pub reserved_20h1: [u8; 40],
}

pub type ExtensionWin10Early = ExtensionWin10<8>;
pub type ExtensionWin10Rs5 = ExtensionWin10<10>;

impl<const ENTROPY: usize> ExtensionWin10<ENTROPY> {
    /// `Size` for builds before 1511 (the `SystemHiveRecoveryInfo` tail was
    /// the end of the structure).
    #[must_use]
    pub const fn size_before_1511() -> u32 {
        (offset_of!(Self, system_hive_recovery_info) + size_of::<[u32; 5]>()) as u32
    }

    /// `Size` for 1511, which ends before the `MajorRelease` additions.
    #[must_use]
    pub const fn size_1511() -> u32 {
        offset_of!(Self, major_release) as u32
    }

    /// `Size` for 1607, which ends before the PCI/retpoline additions.
    #[must_use]
    pub const fn size_1607() -> u32 {
        offset_of!(Self, max_pci_bus_number) as u32
    }

    /// `Size` for 1703/1709, which fence off the `MaxPciBusNumber` tail the
    /// same way (1803 is the first build reading it).
    #[must_use]
    pub const fn size_before_1803() -> u32 {
        offset_of!(Self, max_pci_bus_number) as u32
    }

    /// `Size` for 1803, the last layout before the 1809 growth.
    #[must_use]
    pub const fn size_1803() -> u32 {
        offset_of!(Self, reserved_rs5) as u32
    }

    /// `Size` for 1809.
    #[must_use]
    pub const fn size_1809() -> u32 {
        offset_of!(Self, reserved_19h1) as u32
    }

    /// `Size` for 1903/1909.
    #[must_use]
    pub const fn size_1903() -> u32 {
        offset_of!(Self, reserved_20h1) as u32
    }
}
