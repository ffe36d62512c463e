//! The boot pipeline: from a selected boot option to the kernel entry
//! point. Mirrors the §-by-§ order the kernel's own loader establishes:
//! probe the kernel version, read the registry, build the image graph,
//! assemble the loader store, then hand off.

use crate::boot_option::BootOption;
use crate::context::BootContext;
use crate::debug::{self, Kdnet};
use crate::file_system::{self, WindowsVolume};
use crate::firmware;
use crate::gdt;
use crate::graphics;
use crate::handoff::{self, PageTableArena};
use crate::hw;
use crate::memory_map;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use loader_apiset::ApiSetSchema;
use loader_block::entries::{
    DriverListEntry, ImageListEntry, memory_descriptor_pages, write_arc_disk_list,
    write_boot_driver_list, write_image_list, write_memory_descriptors,
};
use loader_block::tree::write_configuration_tree;
use loader_block::{
    ApiSetVersion, Generation, LoaderStore, OsVersion, StoreLayout, WIN10_BUILD_1703,
};
use loader_hive::SystemHive;
use loader_images::{ImageGraph, ImageSource};
use loader_options::{CommandLine, split_system_path};
use loader_pe::PeImage;
use loader_vmem::{
    IMAGE_VA_BASE, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr, ProtectionOverride, VirtAddr,
    page_count,
};
use loader_pe::headers::{DllCharacteristics, SectionCharacteristics};
use log::{info, warn};
use uefi::Status;

/// A failed boot: which operation, the firmware-style status, and a line of
/// free text for the console.
pub struct BootFailure {
    pub operation: &'static str,
    pub status: Status,
    pub message: String,
}

fn fail(operation: &'static str, status: Status, message: String) -> BootFailure {
    BootFailure {
        operation,
        status,
        message,
    }
}

macro_rules! run {
    ($operation:literal, $status:expr, $result:expr) => {
        $result.map_err(|e| fail($operation, $status, format!("{e}")))?
    };
}

/// Copy a buffer into fresh page-backed memory (pool memory is not page
/// aligned and cannot be mapped as-is).
fn to_pages(ctx: &mut BootContext, data: &[u8]) -> Result<(PhysAddr, u64), BootFailure> {
    let pages = page_count(data.len() as u64).max(1);
    let backing = ctx.memory.alloc_pages(pages).ok_or_else(|| {
        fail(
            "AllocatePages",
            Status::OUT_OF_RESOURCES,
            String::from("out of memory for a data buffer"),
        )
    })?;
    unsafe {
        core::ptr::write_bytes(backing.as_ptr(), 0, (pages * PAGE_SIZE) as usize);
        core::ptr::copy_nonoverlapping(data.as_ptr(), backing.as_ptr(), data.len());
    }
    Ok((backing, pages))
}

/// Probe the kernel's version resource without keeping the image.
fn probe_kernel_version(
    ctx: &mut BootContext,
    source: &mut dyn ImageSource,
    cmdline: &CommandLine,
) -> Result<OsVersion, BootFailure> {
    let name = cmdline.kernel.as_deref().unwrap_or("ntoskrnl.exe");
    let data = run!("open ntoskrnl.exe", Status::NOT_FOUND, source.read("system32", name))
        .ok_or_else(|| {
            fail(
                "open ntoskrnl.exe",
                Status::NOT_FOUND,
                format!("{name} not found in system32"),
            )
        })?;

    let image = run!(
        "PE load",
        Status::LOAD_ERROR,
        PeImage::load(&data, None, &mut ctx.memory, 0)
    );
    let (ms, ls) = image.version();
    image.free(&mut ctx.memory);

    let version = run!("version detect", Status::UNSUPPORTED, OsVersion::detect(ms, ls));
    Ok(version)
}

/// Load `ApiSetSchema.dll` and build the resolver; on 8.1+ the `.apiset`
/// section is additionally copied out and mapped as a system block.
fn load_api_set(
    ctx: &mut BootContext,
    source: &mut dyn ImageSource,
    store: &mut LoaderStore,
    schema_version: ApiSetVersion,
) -> Result<ApiSetSchema, BootFailure> {
    let data = run!(
        "open ApiSetSchema.dll",
        Status::NOT_FOUND,
        source.read("system32", "ApiSetSchema.dll")
    )
    .ok_or_else(|| {
        fail(
            "open ApiSetSchema.dll",
            Status::NOT_FOUND,
            String::from("ApiSetSchema.dll not found"),
        )
    })?;

    let image = run!(
        "PE load",
        Status::LOAD_ERROR,
        PeImage::load(&data, None, &mut ctx.memory, 0)
    );

    let section = image
        .sections()
        .iter()
        .find(|s| s.name_str() == ".apiset")
        .copied()
        .ok_or_else(|| {
            fail(
                "find .apiset",
                Status::NOT_FOUND,
                String::from("no .apiset section in ApiSetSchema.dll"),
            )
        })?;
    if section.virtual_size == 0 {
        return Err(fail(
            "find .apiset",
            Status::INVALID_PARAMETER,
            String::from(".apiset section size was 0"),
        ));
    }

    let start = section.virtual_address as usize;
    let blob = image.bytes()[start..start + section.virtual_size as usize].to_vec();
    image.free(&mut ctx.memory);

    // 8.1 and later map the blob for the kernel; Windows 8 finds the schema
    // through the loaded image instead.
    if !matches!(schema_version, ApiSetVersion::V2) {
        let (backing, pages) = to_pages(ctx, &blob)?;
        let va = run!(
            "map api set",
            Status::OUT_OF_RESOURCES,
            ctx.map_at_cursor(backing, pages, MemoryKind::SystemBlock)
        );
        store.set_api_set_schema(va, blob.len() as u32);
    }

    let resolver_version = match schema_version {
        ApiSetVersion::V2 => loader_apiset::SchemaVersion::V2,
        ApiSetVersion::V4 => loader_apiset::SchemaVersion::V4,
        ApiSetVersion::V6 => loader_apiset::SchemaVersion::V6,
    };
    Ok(ApiSetSchema::new(blob, resolver_version))
}

/// The whole pipeline. Returns only on failure.
#[allow(clippy::too_many_lines)]
pub fn boot(option: &BootOption) -> Result<core::convert::Infallible, BootFailure> {
    let (volume_name, windows_path) = split_system_path(&option.system_path);
    let cmdline = CommandLine::parse(&option.options);

    // Resolve the volume and make sure the Windows directory exists.
    let mut volume = run!(
        "open boot volume",
        Status::NOT_FOUND,
        file_system::open_boot_volume(volume_name, cmdline.subvol).map_err(|s| format!("{s:?}"))
    );
    let arc_name = volume.arc_name.clone();
    let fs_driver = volume.fs_driver.clone();

    if run!(
        "open Windows directory",
        Status::NOT_FOUND,
        file_system::open_file(&mut volume.root, windows_path).map_err(|s| format!("{s:?}"))
    )
    .is_none()
    {
        return Err(fail(
            "open Windows directory",
            Status::NOT_FOUND,
            format!("could not open {windows_path} on the boot volume"),
        ));
    }

    let mut ctx = BootContext::new(firmware::measure_cpu_frequency(), firmware::random_seed());
    info!("TSC runs at {} Hz", ctx.cpu_frequency);

    let windows_path_owned = String::from(windows_path);
    let mut source = WindowsVolume {
        root: &mut volume.root,
        windows_path: windows_path_owned.clone(),
    };

    // Version first; every layout decision hangs off it.
    let version = probe_kernel_version(&mut ctx, &mut source, &cmdline)?;
    let layout = StoreLayout::new(version);

    // The SYSTEM hive: boot drivers, NLS names, errata.
    let hive_data = run!(
        "open SYSTEM hive",
        Status::NOT_FOUND,
        source.read("system32\\config", "SYSTEM")
    )
    .ok_or_else(|| {
        fail(
            "open SYSTEM hive",
            Status::NOT_FOUND,
            String::from("system32\\config\\SYSTEM not found"),
        )
    })?;

    let system = run!(
        "open hive",
        Status::VOLUME_CORRUPTED,
        SystemHive::open(hive_data, version.at_least(Generation::Win8))
    );

    let drivers = run!(
        "enumerate boot drivers",
        Status::VOLUME_CORRUPTED,
        system.enumerate_boot_drivers(fs_driver.as_deref())
    );
    let drivers = run!(
        "sort boot drivers",
        Status::VOLUME_CORRUPTED,
        system.sort_drivers(drivers)
    );
    let lists = if version.at_least(Generation::Win8) {
        SystemHive::split_core_drivers(drivers)
    } else {
        loader_hive::DriverLists {
            core: Vec::new(),
            boot: drivers,
        }
    };

    let nls_names = run!(
        "resolve NLS names",
        Status::VOLUME_CORRUPTED,
        system.nls_file_names(version.fixed_language_file())
    );

    // The store early, so list splicing can target its heads.
    let firmware_revision = uefi::system::uefi_revision();
    let firmware_revision =
        (u32::from(firmware_revision.major()) << 16) | u32::from(firmware_revision.minor());
    let mut store = run!(
        "initialize loader block",
        Status::OUT_OF_RESOURCES,
        LoaderStore::new(layout, &mut ctx.memory, ctx.cpu_frequency, firmware_revision)
    );
    run!(
        "write loader strings",
        Status::OUT_OF_RESOURCES,
        store.set_strings(&arc_name, windows_path, &option.options)
    );

    // Boot-driver list entries, spliced into the store's heads.
    let driver_inputs: Vec<DriverListEntry<'_>> = lists
        .core
        .iter()
        .map(|d| (d, true))
        .chain(lists.boot.iter().map(|d| (d, false)))
        .map(|(d, core)| DriverListEntry {
            service: &d.service,
            file: &d.file,
            dir: &d.dir,
            core,
        })
        .collect();

    let boot_head = store.boot_driver_list_head();
    let core_head = store.core_driver_list_head();
    let (driver_list_base, driver_list_pages, driver_records) = run!(
        "write boot driver list",
        Status::OUT_OF_RESOURCES,
        write_boot_driver_list(
            &driver_inputs,
            boot_head,
            core_head,
            &mut ctx.memory,
            &mut store.fixups,
        )
    );
    run!(
        "map boot driver list",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(driver_list_base, driver_list_pages, MemoryKind::SystemBlock)
    );

    // API-set schema (Win8 and later).
    let apiset = match version.api_set_schema_version() {
        Some(schema_version) => {
            Some(load_api_set(&mut ctx, &mut source, &mut store, schema_version)?)
        }
        None => None,
    };

    // The image graph: kernel and HAL seeds, driver records, then closure
    // over imports.
    let mut graph = ImageGraph::new(IMAGE_VA_BASE);
    graph.add("ntoskrnl.exe", MemoryKind::SystemCode, "system32", false, None, 0, false);
    graph.add("hal.dll", MemoryKind::HalCode, "system32", true, None, 0, false);

    // Windows 8 wants the schema in the load-order list as a plain image.
    if matches!(version.api_set_schema_version(), Some(ApiSetVersion::V2)) {
        graph.add(
            "ApiSetSchema.dll",
            MemoryKind::SystemCode,
            "system32",
            false,
            None,
            0,
            false,
        );
    }

    let driver_iter = lists.core.iter().chain(lists.boot.iter());
    for (index, driver) in driver_iter.enumerate() {
        graph.add(
            &driver.file,
            MemoryKind::SystemCode,
            &driver.dir,
            false,
            Some(driver_records[index]),
            index as u32 + 1,
            false,
        );
    }

    if version.at_least(Generation::Win81) {
        graph.add(
            "crashdmp.sys",
            MemoryKind::SystemCode,
            "system32\\drivers",
            false,
            None,
            0,
            false,
        );
    }

    run!(
        "load images",
        Status::LOAD_ERROR,
        graph.load_all(&mut source, apiset.as_ref(), &cmdline, &mut ctx.memory, ctx.cookie_seed)
    );
    graph.sort();

    // KDNET, when a substituted network stub made it into the graph.
    let mut kdnet = None;
    if cmdline.debug_type.as_deref() == Some("net")
        && let Some(record) = graph.kd_stub_mut()
    {
        let mut descriptor = unsafe { core::mem::zeroed() };
        match debug::find_debug_device(&mut descriptor) {
            Err(status) => warn!("no KDNET-capable device found ({status:?})"),
            Ok(()) => {
                // The stub runs identity-mapped during setup; give the
                // kernel its final base afterwards.
                let va = record.va;
                let image = record.image.as_mut().expect("kd stub is loaded");
                let identity_base = image.address().as_u64();
                run!("relocate kd stub", Status::LOAD_ERROR, image.relocate(identity_base));

                match Kdnet::initialize(&mut ctx, record.pe(), descriptor) {
                    Ok(initialized) => kdnet = Some(initialized),
                    Err(status) => warn!("KDNET initialization failed ({status:?})"),
                }

                let image = record.image.as_mut().expect("kd stub is loaded");
                run!("relocate kd stub", Status::LOAD_ERROR, image.relocate(va.as_u64()));
                record.state = loader_images::ImageState::Relocated;
            }
        }
    }

    run!(
        "resolve imports",
        Status::LOAD_ERROR,
        graph.resolve_imports(apiset.as_ref())
    );
    run!(
        "pack images",
        Status::OUT_OF_RESOURCES,
        graph.make_contiguous(&mut ctx.memory)
    );

    // Map every image with per-section protection, then move the general
    // cursor past the image window (next large-page boundary).
    for record in graph.images() {
        let pe = record.pe();
        run!(
            "map image",
            Status::OUT_OF_RESOURCES,
            ctx.map_fixed(record.va, pe.address(), pe.page_span(), record.memory_kind)
        );

        for section in pe.sections() {
            let flags = SectionCharacteristics::from_bits_retain(section.characteristics);
            let first_page = section.virtual_address as u64 / PAGE_SIZE;
            let pages = page_count(u64::from(section.virtual_size.max(1)));
            ctx.mappings.add_protection(ProtectionOverride {
                va: record.va.add(first_page * PAGE_SIZE),
                pages,
                protection: loader_vmem::PageProtection {
                    write: flags.contains(SectionCharacteristics::MEM_WRITE),
                    execute: flags.contains(SectionCharacteristics::MEM_EXECUTE),
                },
            });
        }
    }

    let end_of_images = graph.next_va();
    ctx.va.advance_to(end_of_images);
    ctx.va.align_to(0x40_0000);

    // Kernel entry point before the records are consumed.
    let entry_point = VirtAddr::new(graph.images()[0].pe().entry_point());

    // Map the store itself.
    let store_va = run!(
        "map loader block",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(store.base(), store.pages(), MemoryKind::SystemBlock)
    );

    // The load-order list.
    let image_inputs: Vec<ImageListEntry<'_>> = graph
        .images()
        .iter()
        .map(|record| {
            let pe = record.pe();
            ImageListEntry {
                name: &record.name,
                dir: &record.dir,
                dll_base: record.va,
                size_of_image: pe.size(),
                entry_point: VirtAddr::new(pe.entry_point()),
                check_sum: pe.checksum(),
                is_dll: record.is_dll,
                force_integrity: pe
                    .dll_characteristics()
                    .contains(DllCharacteristics::FORCE_INTEGRITY),
                dont_relocate: record.no_reloc,
                bdle: record.bdle,
            }
        })
        .collect();
    let load_order_head = store.load_order_list_head();
    let (image_list_base, image_list_pages) = run!(
        "write image list",
        Status::OUT_OF_RESOURCES,
        write_image_list(&image_inputs, load_order_head, &mut ctx.memory, &mut store.fixups)
    );
    run!(
        "map image list",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(image_list_base, image_list_pages, MemoryKind::SystemBlock)
    );

    // Descriptor tables and the PCR before the stacks, like the original
    // loader's layout.
    let tables = run!(
        "build descriptor tables",
        Status::OUT_OF_RESOURCES,
        gdt::build_descriptor_tables(&mut ctx).map_err(|s| format!("{s:?}"))
    );
    // Kernels before 1703 carve out their own PCR on x86-64.
    if version.build >= WIN10_BUILD_1703 {
        let pcr = run!(
            "allocate PCR",
            Status::OUT_OF_RESOURCES,
            handoff::allocate_pcr(&mut ctx).map_err(|s| format!("{s:?}"))
        );
        store.set_prcb(pcr.prcb);
    }
    run!(
        "allocate shared data page",
        Status::OUT_OF_RESOURCES,
        handoff::allocate_user_shared_data(&mut ctx).map_err(|s| format!("{s:?}"))
    );

    let stacks = run!(
        "allocate kernel stacks",
        Status::OUT_OF_RESOURCES,
        handoff::allocate_kernel_stacks(&mut ctx, &version, tables.tss).map_err(|s| format!("{s:?}"))
    );
    store.set_kernel_stack(stacks.kernel_stack);

    // NLS tables.
    let mut read_required = |dir: &str, name: &str| -> Result<Vec<u8>, BootFailure> {
        source
            .read(dir, name)
            .map_err(|e| fail("read file", Status::NOT_FOUND, format!("{e}")))?
            .ok_or_else(|| fail("read file", Status::NOT_FOUND, format!("{dir}\\{name} not found")))
    };

    info!(
        "loading NLS tables {} {} {}",
        nls_names.ansi, nls_names.oem, nls_names.language
    );
    let acp = read_required("system32", &nls_names.ansi)?;
    let oem = read_required("system32", &nls_names.oem)?;
    let language = read_required("system32", &nls_names.language)?;

    let mut map_blob = |ctx: &mut BootContext, data: &[u8], kind| -> Result<VirtAddr, BootFailure> {
        let (backing, pages) = to_pages(ctx, data)?;
        ctx.map_at_cursor(backing, pages, kind)
            .map_err(|e| fail("add_mapping", Status::OUT_OF_RESOURCES, format!("{e}")))
    };

    let acp_va = map_blob(&mut ctx, &acp, MemoryKind::NlsData)?;
    let oem_va = map_blob(&mut ctx, &oem, MemoryKind::NlsData)?;
    let language_va = map_blob(&mut ctx, &language, MemoryKind::NlsData)?;
    store.set_nls(acp_va, oem_va, language_va);

    // Driver database and errata INF, both optional.
    match source.read("AppPatch", "drvmain.sdb") {
        Ok(Some(data)) => {
            let va = map_blob(&mut ctx, &data, MemoryKind::RegistryData)?;
            store.set_drvdb(va, data.len() as u32);
        }
        _ => info!("drvmain.sdb not found"),
    }

    match system.errata_inf_name(version.at_least(Generation::Vista)) {
        Ok(inf_name) => match source.read("inf", &inf_name) {
            Ok(Some(data)) => {
                let va = map_blob(&mut ctx, &data, MemoryKind::RegistryData)?;
                store.set_errata(va, data.len() as u32);
            }
            _ => info!("{inf_name} not found"),
        },
        Err(_) => info!("no errata INF named in the registry"),
    }

    // The hive itself survives for the kernel, unchanged.
    let hive_bytes = system.steal_data();
    let (hive_backing, hive_pages) = to_pages(&mut ctx, &hive_bytes)?;
    let hive_va = run!(
        "map registry",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(hive_backing, hive_pages, MemoryKind::RegistryData)
    );
    store.set_registry(hive_va, hive_bytes.len() as u32);
    drop(hive_bytes);

    // EFI runtime regions and the preserved runtime map.
    let runtime_map = run!(
        "map EFI runtime",
        Status::OUT_OF_RESOURCES,
        memory_map::map_efi_runtime(&mut ctx).map_err(|s| format!("{s:?}"))
    );
    run!(
        "map EFI runtime map",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(runtime_map.buffer, runtime_map.pages, MemoryKind::SystemBlock)
    );
    store.set_efi_memory_map(runtime_map.buffer, runtime_map.size, runtime_map.descriptor_size);
    store.set_virtual_efi_runtime_services(PhysAddr::new(
        firmware::runtime_services_get_time_slot(),
    ));

    // Debug transport mappings.
    if let Some(kdnet) = kdnet.as_mut() {
        run!(
            "map debug descriptor",
            Status::OUT_OF_RESOURCES,
            kdnet.map(&mut ctx).map_err(|s| format!("{s:?}"))
        );
        store.set_kd_debug_device(&kdnet.descriptor);
    }

    // Graphics: GOP with the boot-graphics context on Win8+, CSM as the
    // fallback. A headless system boots without either.
    if version.at_least(Generation::Win8) {
        let fonts = graphics::load_fonts(&mut ctx, source.root, &windows_path_owned);
        match graphics::set_graphics_mode(&mut ctx, &fonts) {
            Ok(bg) => store.set_boot_graphics(&bg),
            Err(status) => {
                warn!("GOP failed ({status:?}), falling back to CSM");
                if let Err(status) = graphics::initialize_csm() {
                    warn!("no CSM either ({status:?}); continuing headless");
                }
            }
        }
    } else if let Err(status) = graphics::initialize_csm() {
        warn!("no CSM ({status:?}); continuing headless");
    }

    // Configuration tree and the ARC disk list.
    let devices = hw::block_devices();
    let tree = hw::build_configuration_tree(&devices);
    let (tree_root, tree_base, tree_pages) = run!(
        "write configuration tree",
        Status::OUT_OF_RESOURCES,
        write_configuration_tree(&tree, &mut ctx.memory, &mut store.fixups)
    );
    run!(
        "map configuration tree",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(tree_base, tree_pages, MemoryKind::SystemBlock)
    );
    store.set_configuration_root(tree_root);

    let disks = hw::arc_disk_entries(&devices, &arc_name);
    let new_format = version.at_least(Generation::Win7)
        || (version.generation == Generation::Vista && version.build >= 6002);
    let arc_head = store.arc_disk_list_head();
    let (disk_base, disk_pages) = run!(
        "write disk signatures",
        Status::OUT_OF_RESOURCES,
        write_arc_disk_list(&disks, arc_head, new_format, &mut ctx.memory, &mut store.fixups)
    );
    run!(
        "map disk signatures",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(disk_base, disk_pages, MemoryKind::SystemBlock)
    );

    store.set_system_time(firmware::system_time());

    // Close the plan: page-table arena, the descriptor buffer, then the
    // firmware regions, then the descriptor list itself.
    let mut arena = run!(
        "reserve page tables",
        Status::OUT_OF_RESOURCES,
        PageTableArena::reserve(&mut ctx).map_err(|s| format!("{s:?}"))
    );

    let descriptor_pages = memory_descriptor_pages(ctx.mappings.len() + 256);
    let descriptor_buffer = ctx.memory.alloc_pages(descriptor_pages).ok_or_else(|| {
        fail(
            "AllocatePages",
            Status::OUT_OF_RESOURCES,
            String::from("out of memory for the descriptor list"),
        )
    })?;
    run!(
        "map descriptor list",
        Status::OUT_OF_RESOURCES,
        ctx.map_at_cursor(descriptor_buffer, descriptor_pages, MemoryKind::SystemBlock)
    );

    run!(
        "process memory map",
        Status::OUT_OF_RESOURCES,
        memory_map::add_firmware_descriptors(&mut ctx).map_err(|s| format!("{s:?}"))
    );

    store.set_loader_pages_spanned(ctx.pages_spanned());

    let descriptor_head = store.memory_descriptor_list_head();
    run!(
        "write memory descriptors",
        Status::OUT_OF_RESOURCES,
        write_memory_descriptors(
            &ctx.mappings,
            descriptor_head,
            descriptor_buffer,
            descriptor_pages,
            &mut store.fixups,
        )
    );

    let identity = run!(
        "collect identity ranges",
        Status::OUT_OF_RESOURCES,
        memory_map::identity_ranges().map_err(|s| format!("{s:?}"))
    );

    info!(
        "handing off: {} images, {} mappings, entry {entry_point}",
        graph.images().len(),
        ctx.mappings.len()
    );

    handoff::depart(
        &mut ctx,
        &store,
        &tables,
        &mut arena,
        &identity,
        kdnet,
        entry_point,
        stacks.rsp0,
        store_va,
    )
    .map_err(|status| fail("enable paging", status, String::from("kernel handoff failed")))
}
