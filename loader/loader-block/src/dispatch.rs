//! One-time layout dispatch: from an [`OsVersion`] to the byte offsets of
//! every field the assembly routines touch. After this point no code probes
//! the target version for structure shape again.

use crate::layouts::{
    ArcDiskInformation, BootGraphicsContextV1, BootGraphicsContextV2, BootGraphicsContextV3,
    BootGraphicsContextV4, DebugDeviceDescriptor, ExtensionVista, ExtensionVistaSp2,
    ExtensionWin7, ExtensionWin8, ExtensionWin10, ExtensionWin10Early, ExtensionWin10Rs5,
    ExtensionWin81, ExtensionWs03, LoaderBlockVista, LoaderBlockWin7, LoaderBlockWin8,
    LoaderBlockWin10, LoaderBlockWin81, LoaderBlockWs03, LoaderPerformanceData, NlsDataBlock,
    WIN81_REVISION_GROWN_TAIL,
};
use crate::version::{
    Generation, OsVersion, WIN10_BUILD_1511, WIN10_BUILD_1607, WIN10_BUILD_1703,
    WIN10_BUILD_1803, WIN10_BUILD_1809, WIN10_BUILD_1903,
};
use core::mem::offset_of;

/// Byte offsets (relative to the block region) of the block fields.
#[derive(Clone, Debug)]
pub struct BlockOffsets {
    /// `OsMajorVersion`/`OsMinorVersion`/`Size` header (Win7 and later).
    pub version_header: Option<usize>,
    /// `Size` value the target expects, when the header exists.
    pub size_value: Option<u32>,
    /// `OsLoaderSecurityVersion` value (Win10 1511+ wants 1).
    pub os_loader_security_version: Option<u32>,
    pub lists: usize,
    pub early_launch_list: Option<usize>,
    pub core_driver_list: Option<usize>,
    pub core_extensions_list: Option<usize>,
    pub tpm_core_list: Option<usize>,
    pub threads: usize,
    pub kernel_stack_size: Option<usize>,
    pub registry_length: usize,
    pub registry_base: usize,
    pub paths: usize,
    pub extension_ptr: usize,
    pub firmware: Option<usize>,
}

/// Byte offsets (relative to the extension region) of the extension fields.
#[derive(Clone, Debug)]
pub struct ExtensionOffsets {
    /// Value of the leading `Size` field for this exact revision.
    pub size_value: u32,
    pub profile: usize,
    /// `MajorVersion`/`MinorVersion` pair (WS03/Vista carry it here).
    pub major_minor: Option<usize>,
    pub errata: usize,
    pub loader_pages_spanned: Option<usize>,
    pub drvdb: usize,
    pub firmware: usize,
    pub loader_performance_data: Option<usize>,
    pub persistent: Option<usize>,
    pub graphics: Option<usize>,
    pub tpm_entropy: Option<usize>,
    pub boot_entropy: Option<usize>,
    pub processor_counter_frequency: Option<usize>,
    pub hal_and_time: Option<usize>,
    pub api_set: Option<usize>,
    pub kd_debug_device: Option<usize>,
    /// Offset and value of `MajorRelease` (1607+).
    pub major_release: Option<(usize, u32)>,
}

/// The complete dispatch result.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    pub version: OsVersion,
    pub block: BlockOffsets,
    pub extension: ExtensionOffsets,
}

macro_rules! block_offsets_common {
    ($ty:ty) => {
        BlockOffsets {
            version_header: None,
            size_value: None,
            os_loader_security_version: None,
            lists: offset_of!($ty, lists),
            early_launch_list: None,
            core_driver_list: None,
            core_extensions_list: None,
            tpm_core_list: None,
            threads: offset_of!($ty, threads),
            kernel_stack_size: None,
            registry_length: offset_of!($ty, registry_length),
            registry_base: offset_of!($ty, registry_base),
            paths: offset_of!($ty, paths),
            extension_ptr: offset_of!($ty, extension),
            firmware: None,
        }
    };
}

fn block_offsets(version: &OsVersion) -> BlockOffsets {
    match version.generation {
        Generation::Ws03 => block_offsets_common!(LoaderBlockWs03),
        Generation::Vista => {
            let mut offsets = block_offsets_common!(LoaderBlockVista);
            offsets.firmware = Some(offset_of!(LoaderBlockVista, firmware_information));
            offsets
        }
        Generation::Win7 => {
            let mut offsets = block_offsets_common!(LoaderBlockWin7);
            offsets.version_header = Some(0);
            offsets.size_value = Some(size_of::<LoaderBlockWin7>() as u32);
            offsets.firmware = Some(offset_of!(LoaderBlockWin7, firmware_information));
            offsets
        }
        Generation::Win8 | Generation::Win81 => {
            // The two compositions are identical; use the Win8 type.
            let mut offsets = block_offsets_common!(LoaderBlockWin8);
            offsets.version_header = Some(0);
            offsets.size_value = Some(size_of::<LoaderBlockWin8>() as u32);
            offsets.early_launch_list = Some(offset_of!(LoaderBlockWin8, early_launch_list_head));
            offsets.core_driver_list = Some(offset_of!(LoaderBlockWin8, core_driver_list_head));
            offsets.kernel_stack_size = Some(offset_of!(LoaderBlockWin8, kernel_stack_size));
            offsets.firmware = Some(offset_of!(LoaderBlockWin8, firmware_information));
            offsets
        }
        Generation::Win10 => {
            let mut offsets = block_offsets_common!(LoaderBlockWin10);
            offsets.version_header = Some(0);
            offsets.size_value = Some(if version.build >= WIN10_BUILD_1803 {
                size_of::<LoaderBlockWin10>() as u32
            } else {
                LoaderBlockWin10::size_before_1803()
            });
            if version.build >= WIN10_BUILD_1511 {
                offsets.os_loader_security_version = Some(1);
            }
            offsets.early_launch_list =
                Some(offset_of!(LoaderBlockWin10, early_launch_list_head));
            offsets.core_driver_list = Some(offset_of!(LoaderBlockWin10, core_driver_list_head));
            offsets.core_extensions_list = Some(offset_of!(
                LoaderBlockWin10,
                core_extensions_driver_list_head
            ));
            offsets.tpm_core_list = Some(offset_of!(LoaderBlockWin10, tpm_core_driver_list_head));
            offsets.kernel_stack_size = Some(offset_of!(LoaderBlockWin10, kernel_stack_size));
            offsets.firmware = Some(offset_of!(LoaderBlockWin10, firmware_information));
            offsets
        }
    }
}

macro_rules! ext_offsets_common {
    ($ty:ty) => {
        ExtensionOffsets {
            size_value: size_of::<$ty>() as u32,
            profile: offset_of!($ty, head.profile),
            major_minor: None,
            errata: offset_of!($ty, errata),
            loader_pages_spanned: None,
            drvdb: offset_of!($ty, drvdb),
            firmware: offset_of!($ty, firmware),
            loader_performance_data: None,
            persistent: None,
            graphics: None,
            tpm_entropy: None,
            boot_entropy: None,
            processor_counter_frequency: None,
            hal_and_time: None,
            api_set: None,
            kd_debug_device: None,
            major_release: None,
        }
    };
}

fn win10_extension_offsets<const ENTROPY: usize>(version: &OsVersion) -> ExtensionOffsets {
    let mut offsets = ext_offsets_common!(ExtensionWin10<ENTROPY>);

    offsets.size_value = match version.build {
        0..WIN10_BUILD_1511 => ExtensionWin10::<ENTROPY>::size_before_1511(),
        WIN10_BUILD_1511..WIN10_BUILD_1607 => ExtensionWin10::<ENTROPY>::size_1511(),
        WIN10_BUILD_1607..WIN10_BUILD_1703 => ExtensionWin10::<ENTROPY>::size_1607(),
        WIN10_BUILD_1703..WIN10_BUILD_1803 => ExtensionWin10::<ENTROPY>::size_before_1803(),
        WIN10_BUILD_1803..WIN10_BUILD_1809 => ExtensionWin10::<ENTROPY>::size_1803(),
        WIN10_BUILD_1809..WIN10_BUILD_1903 => ExtensionWin10::<ENTROPY>::size_1809(),
        WIN10_BUILD_1903..=u16::MAX => {
            if version.build < crate::version::WIN10_BUILD_2004 {
                ExtensionWin10::<ENTROPY>::size_1903()
            } else {
                size_of::<ExtensionWin10<ENTROPY>>() as u32
            }
        }
    };

    offsets.persistent = Some(offset_of!(ExtensionWin10<ENTROPY>, persistent));
    offsets.graphics = Some(offset_of!(ExtensionWin10<ENTROPY>, graphics));
    offsets.boot_entropy = Some(offset_of!(ExtensionWin10<ENTROPY>, boot_entropy_result));
    offsets.processor_counter_frequency = Some(offset_of!(
        ExtensionWin10<ENTROPY>,
        processor_counter_frequency
    ));
    offsets.hal_and_time = Some(offset_of!(ExtensionWin10<ENTROPY>, hal_and_time));
    offsets.api_set = Some(offset_of!(ExtensionWin10<ENTROPY>, api_set));
    offsets.kd_debug_device = Some(offset_of!(ExtensionWin10<ENTROPY>, kd_debug_device));

    // 1903 on carries the performance data inline instead.
    if version.build < WIN10_BUILD_1903 {
        offsets.loader_performance_data = Some(offset_of!(
            ExtensionWin10<ENTROPY>,
            loader_performance_data
        ));
    }

    if let Some(release) = version.major_release()
        && version.build >= WIN10_BUILD_1607
    {
        offsets.major_release = Some((offset_of!(ExtensionWin10<ENTROPY>, major_release), release));
    }

    offsets
}

fn extension_offsets(version: &OsVersion) -> ExtensionOffsets {
    match version.generation {
        Generation::Ws03 => {
            let mut offsets = ext_offsets_common!(ExtensionWs03);
            offsets.major_minor = Some(offset_of!(ExtensionWs03, major_version));
            offsets.loader_pages_spanned =
                Some(offset_of!(ExtensionWs03, loader_pages_spanned));
            offsets
        }
        Generation::Vista if version.build < 6002 => {
            let mut offsets = ext_offsets_common!(ExtensionVista);
            offsets.major_minor = Some(offset_of!(ExtensionVista, major_version));
            offsets.loader_pages_spanned =
                Some(offset_of!(ExtensionVista, loader_pages_spanned));
            offsets.loader_performance_data =
                Some(offset_of!(ExtensionVista, loader_performance_data));
            offsets.persistent = Some(offset_of!(ExtensionVista, persistent));
            offsets
        }
        Generation::Vista => {
            let mut offsets = ext_offsets_common!(ExtensionVistaSp2);
            offsets.major_minor = Some(offset_of!(ExtensionVistaSp2, major_version));
            offsets.loader_pages_spanned =
                Some(offset_of!(ExtensionVistaSp2, loader_pages_spanned));
            offsets.loader_performance_data =
                Some(offset_of!(ExtensionVistaSp2, loader_performance_data));
            offsets.persistent = Some(offset_of!(ExtensionVistaSp2, persistent));
            offsets
        }
        Generation::Win7 => {
            let mut offsets = ext_offsets_common!(ExtensionWin7);
            offsets.loader_pages_spanned =
                Some(offset_of!(ExtensionWin7, loader_pages_spanned));
            offsets.loader_performance_data =
                Some(offset_of!(ExtensionWin7, loader_performance_data));
            offsets.persistent = Some(offset_of!(ExtensionWin7, persistent));
            offsets.graphics = Some(offset_of!(ExtensionWin7, graphics));
            offsets.tpm_entropy = Some(offset_of!(ExtensionWin7, tpm_boot_entropy_result));
            offsets.processor_counter_frequency =
                Some(offset_of!(ExtensionWin7, processor_counter_frequency));
            offsets
        }
        Generation::Win8 => {
            let mut offsets = ext_offsets_common!(ExtensionWin8);
            offsets.loader_performance_data =
                Some(offset_of!(ExtensionWin8, loader_performance_data));
            offsets.persistent = Some(offset_of!(ExtensionWin8, persistent));
            offsets.graphics = Some(offset_of!(ExtensionWin8, graphics));
            offsets.boot_entropy = Some(offset_of!(ExtensionWin8, boot_entropy_result));
            offsets.processor_counter_frequency =
                Some(offset_of!(ExtensionWin8, processor_counter_frequency));
            offsets.hal_and_time = Some(offset_of!(ExtensionWin8, hal_and_time));
            offsets
        }
        Generation::Win81 => {
            let mut offsets = ext_offsets_common!(ExtensionWin81);
            offsets.size_value = if version.revision >= WIN81_REVISION_GROWN_TAIL {
                size_of::<ExtensionWin81>() as u32
            } else {
                ExtensionWin81::size_before_18438()
            };
            offsets.loader_performance_data =
                Some(offset_of!(ExtensionWin81, loader_performance_data));
            offsets.persistent = Some(offset_of!(ExtensionWin81, persistent));
            offsets.graphics = Some(offset_of!(ExtensionWin81, graphics));
            offsets.boot_entropy = Some(offset_of!(ExtensionWin81, boot_entropy_result));
            offsets.processor_counter_frequency =
                Some(offset_of!(ExtensionWin81, processor_counter_frequency));
            offsets.hal_and_time = Some(offset_of!(ExtensionWin81, hal_and_time));
            offsets.api_set = Some(offset_of!(ExtensionWin81, api_set));
            offsets.kd_debug_device = Some(offset_of!(ExtensionWin81, kd_debug_device));
            offsets
        }
        Generation::Win10 => {
            if version.build >= WIN10_BUILD_1809 {
                win10_extension_offsets::<10>(version)
            } else {
                win10_extension_offsets::<8>(version)
            }
        }
    }
}

impl StoreLayout {
    #[must_use]
    pub fn new(version: OsVersion) -> Self {
        Self {
            version,
            block: block_offsets(&version),
            extension: extension_offsets(&version),
        }
    }
}

// ---------------------------------------------------------------------------
// Store region map (offsets shared by every version, sized for the largest)
// ---------------------------------------------------------------------------

const fn max2(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

const fn align16(x: usize) -> usize {
    (x + 15) & !15
}

pub const BLOCK_REGION: usize = 0;
pub const BLOCK_REGION_SIZE: usize = align16(max2(
    max2(
        max2(size_of::<LoaderBlockWs03>(), size_of::<LoaderBlockVista>()),
        max2(size_of::<LoaderBlockWin7>(), size_of::<LoaderBlockWin8>()),
    ),
    max2(size_of::<LoaderBlockWin81>(), size_of::<LoaderBlockWin10>()),
));

pub const EXTENSION_REGION: usize = BLOCK_REGION + BLOCK_REGION_SIZE;
pub const EXTENSION_REGION_SIZE: usize = align16(max2(
    max2(
        max2(size_of::<ExtensionWs03>(), size_of::<ExtensionVistaSp2>()),
        max2(size_of::<ExtensionWin7>(), size_of::<ExtensionWin8>()),
    ),
    max2(
        size_of::<ExtensionWin81>(),
        max2(
            size_of::<ExtensionWin10Early>(),
            size_of::<ExtensionWin10Rs5>(),
        ),
    ),
));

pub const STRINGS_REGION: usize = EXTENSION_REGION + EXTENSION_REGION_SIZE;
pub const STRINGS_REGION_SIZE: usize = 1024;

pub const NLS_REGION: usize = STRINGS_REGION + STRINGS_REGION_SIZE;
pub const NLS_REGION_SIZE: usize = align16(size_of::<NlsDataBlock>());

pub const ARC_DISK_REGION: usize = NLS_REGION + NLS_REGION_SIZE;
pub const ARC_DISK_REGION_SIZE: usize = align16(size_of::<ArcDiskInformation>());

pub const PERFORMANCE_REGION: usize = ARC_DISK_REGION + ARC_DISK_REGION_SIZE;
pub const PERFORMANCE_REGION_SIZE: usize = align16(size_of::<LoaderPerformanceData>());

pub const DEBUG_DESCRIPTOR_REGION: usize = PERFORMANCE_REGION + PERFORMANCE_REGION_SIZE;
pub const DEBUG_DESCRIPTOR_REGION_SIZE: usize = align16(size_of::<DebugDeviceDescriptor>());

pub const GRAPHICS_REGION: usize = DEBUG_DESCRIPTOR_REGION + DEBUG_DESCRIPTOR_REGION_SIZE;
pub const GRAPHICS_REGION_SIZE: usize = align16(max2(
    max2(
        size_of::<BootGraphicsContextV1>(),
        size_of::<BootGraphicsContextV2>(),
    ),
    max2(
        size_of::<BootGraphicsContextV3>(),
        size_of::<BootGraphicsContextV4>(),
    ),
));

pub const STORE_SIZE: usize = GRAPHICS_REGION + GRAPHICS_REGION_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{
        NTDDI_WIN10_RS5, WIN10_BUILD_1709, WIN10_BUILD_2004, WIN10_BUILD_21H1,
    };

    fn v(major: u16, minor: u16, build: u16, revision: u16) -> OsVersion {
        OsVersion::detect(
            (u32::from(major) << 16) | u32::from(minor),
            (u32::from(build) << 16) | u32::from(revision),
        )
        .unwrap()
    }

    #[test]
    fn win81_extension_size_depends_on_the_revision() {
        let old = StoreLayout::new(v(6, 3, 9600, 17000));
        let new = StoreLayout::new(v(6, 3, 9600, 19000));

        assert_eq!(old.extension.size_value, ExtensionWin81::size_before_18438());
        assert_eq!(new.extension.size_value, size_of::<ExtensionWin81>() as u32);
        assert!(old.extension.size_value < new.extension.size_value);
    }

    #[test]
    fn win10_block_size_fences_the_bootstat_tail() {
        let early = StoreLayout::new(v(10, 0, WIN10_BUILD_1709, 0));
        let late = StoreLayout::new(v(10, 0, WIN10_BUILD_1803, 0));

        assert_eq!(
            early.block.size_value,
            Some(LoaderBlockWin10::size_before_1803())
        );
        assert_eq!(
            late.block.size_value,
            Some(size_of::<LoaderBlockWin10>() as u32)
        );
    }

    #[test]
    fn win10_extension_sizes_grow_per_build() {
        let sizes: alloc::vec::Vec<u32> = [
            10240u16,
            WIN10_BUILD_1511,
            WIN10_BUILD_1607,
            WIN10_BUILD_1703,
            WIN10_BUILD_1803,
            WIN10_BUILD_1809,
            WIN10_BUILD_1903,
            WIN10_BUILD_2004,
        ]
        .iter()
        .map(|&b| StoreLayout::new(v(10, 0, b, 0)).extension.size_value)
        .collect();

        // 1703 repeats the 1607 boundary (the tail appeared in 1803);
        // everything else strictly grows. The 1809 jump also reflects the
        // wider entropy array.
        assert!(sizes[0] < sizes[1]);
        assert!(sizes[1] < sizes[2]);
        assert_eq!(sizes[2], sizes[3]);
        assert!(sizes[3] < sizes[4]);
        assert!(sizes[4] < sizes[5]);
        assert!(sizes[5] < sizes[6]);
        assert!(sizes[6] < sizes[7]);
    }

    #[test]
    fn rs5_layout_carries_major_release_and_wide_entropy() {
        let layout = StoreLayout::new(v(10, 0, 17763, 1));
        let (_, release) = layout.extension.major_release.unwrap();
        assert_eq!(release, NTDDI_WIN10_RS5);
        assert!(layout.extension.boot_entropy.is_some());
        assert!(layout.extension.loader_performance_data.is_some());

        // 1903+ switches to the inline performance block.
        let layout = StoreLayout::new(v(10, 0, WIN10_BUILD_21H1, 0));
        assert!(layout.extension.loader_performance_data.is_none());
    }

    #[test]
    fn pre_win8_layouts_have_no_core_lists_or_api_set()
    {
        let layout = StoreLayout::new(v(6, 1, 7601, 0));
        assert!(layout.block.core_driver_list.is_none());
        assert!(layout.extension.api_set.is_none());
        assert!(layout.extension.tpm_entropy.is_some());

        let layout = StoreLayout::new(v(6, 2, 9200, 0));
        assert!(layout.block.core_driver_list.is_some());
        // Win8 passes the schema as an image, not through the extension.
        assert!(layout.extension.api_set.is_none());

        let layout = StoreLayout::new(v(6, 3, 9600, 18438));
        assert!(layout.extension.api_set.is_some());
        assert!(layout.extension.kd_debug_device.is_some());
    }

    #[test]
    fn store_regions_are_disjoint_and_ordered() {
        assert!(BLOCK_REGION_SIZE >= size_of::<LoaderBlockWin10>());
        assert!(EXTENSION_REGION_SIZE >= size_of::<ExtensionWin10Rs5>());
        assert!(EXTENSION_REGION >= BLOCK_REGION + BLOCK_REGION_SIZE);
        assert!(STRINGS_REGION >= EXTENSION_REGION + EXTENSION_REGION_SIZE);
        assert!(STORE_SIZE > GRAPHICS_REGION);
    }
}
