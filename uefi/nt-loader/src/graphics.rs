//! Boot graphics: GOP mode selection, framebuffer mapping, fonts, and the
//! CSM fallback for systems without a usable GOP.

use crate::context::BootContext;
use crate::file_system::read_file;
use loader_block::BootGraphics;
use loader_vmem::{MemoryKind, PhysAddr, VirtAddr, page_count};
use log::{info, warn};
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat};
use uefi::proto::media::file::Directory;
use uefi::proto::unsafe_protocol;
use uefi::{Status, boot};

/// Font files read from `\Windows\Fonts` (optional).
pub struct Fonts {
    pub system: Option<(PhysAddr, u32)>,
    pub console: Option<(PhysAddr, u32)>,
}

/// Read the system and console font files into page allocations. Absence
/// is not an error.
pub fn load_fonts(ctx: &mut BootContext, windir: &mut Directory, windows_path: &str) -> Fonts {
    let mut load = |name: &str| -> Option<(PhysAddr, u32)> {
        let path = alloc::format!("{windows_path}\\Fonts\\{name}");
        let data = read_file(windir, &path).ok().flatten()?;
        let pages = page_count(data.len() as u64);
        let backing = loader_vmem::PageAllocator::alloc_pages(&mut ctx.memory, pages)?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), backing.as_ptr(), data.len());
        }
        Some((backing, data.len() as u32))
    };

    let system = load("arial.ttf");
    let console = load("cour.ttf");
    if system.is_none() || console.is_none() {
        warn!("boot fonts not found");
    }
    Fonts { system, console }
}

/// Pick the largest BGR mode, map the framebuffer and the reserve pool, and
/// return the context parameters for the store.
pub fn set_graphics_mode(ctx: &mut BootContext, fonts: &Fonts) -> Result<BootGraphics, Status> {
    let handle =
        boot::get_handle_for_protocol::<GraphicsOutput>().map_err(|e| e.status())?;
    let mut gop =
        boot::open_protocol_exclusive::<GraphicsOutput>(handle).map_err(|e| e.status())?;

    let best = gop
        .modes()
        .filter(|mode| mode.info().pixel_format() == PixelFormat::Bgr)
        .max_by_key(|mode| {
            let (width, height) = mode.info().resolution();
            width * height
        })
        .ok_or(Status::NOT_FOUND)?;
    gop.set_mode(&best).map_err(|e| e.status())?;

    let info = gop.current_mode_info();
    let (width, height) = info.resolution();
    let mut framebuffer = gop.frame_buffer();
    let fb_base = PhysAddr::new(framebuffer.as_mut_ptr() as u64);
    let fb_pages = page_count(framebuffer.size() as u64);

    let fb_va = ctx
        .map_at_cursor(fb_base, fb_pages, MemoryKind::FirmwarePermanent)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;
    info!("framebuffer {width}x{height} mapped at {fb_va}");

    // Scratch pool the boot-graphics library draws through.
    const RESERVE_POOL_SIZE: u32 = 0x4000;
    let pool = loader_vmem::PageAllocator::alloc_pages(
        &mut ctx.memory,
        page_count(u64::from(RESERVE_POOL_SIZE)),
    )
    .ok_or(Status::OUT_OF_RESOURCES)?;
    let pool_va = ctx
        .map_at_cursor(
            pool,
            page_count(u64::from(RESERVE_POOL_SIZE)),
            MemoryKind::FirmwarePermanent,
        )
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    let mut map_font = |font: Option<(PhysAddr, u32)>| -> Option<(VirtAddr, u32)> {
        let (base, size) = font?;
        let va = ctx
            .map_at_cursor(base, page_count(u64::from(size)), MemoryKind::FirmwarePermanent)
            .ok()?;
        Some((va, size))
    };
    let system_font = map_font(fonts.system);
    let console_font = map_font(fonts.console);

    Ok(BootGraphics {
        width: width as u32,
        height: height as u32,
        pixels_per_scan_line: info.stride() as u32,
        framebuffer: fb_va,
        system_font,
        console_font,
        reserve_pool: pool_va,
        reserve_pool_size: RESERVE_POOL_SIZE,
    })
}

/// Legacy BIOS compatibility support module.
#[repr(C)]
#[unsafe_protocol("db9a1e3d-45cb-4abb-853b-e5387fdb2e2d")]
pub struct LegacyBiosProtocol {
    int86: usize,
    far_call86: usize,
    check_pci_rom: usize,
    install_pci_rom: usize,
    legacy_boot: usize,
    update_keyboard_led_status: usize,
    get_bbs_info: usize,
    shadow_all_legacy_oproms: unsafe extern "efiapi" fn(*mut Self) -> Status,
    prepare_to_boot_efi: usize,
    get_legacy_region: usize,
    copy_legacy_region: usize,
    boot_unconventional_device: usize,
}

/// Pre-Win8 fallback: shadow the legacy option ROMs so the kernel finds
/// INT 10h services.
pub fn initialize_csm() -> Result<(), Status> {
    let handles = boot::find_handles::<LegacyBiosProtocol>().map_err(|e| e.status())?;
    if handles.is_empty() {
        return Err(Status::NOT_FOUND);
    }

    for handle in handles {
        let Ok(mut csm) = boot::open_protocol_exclusive::<LegacyBiosProtocol>(handle) else {
            continue;
        };
        let this = core::ptr::from_mut(&mut *csm);
        let status = unsafe { (csm.shadow_all_legacy_oproms)(this) };
        if status != Status::SUCCESS {
            warn!("ShadowAllLegacyOproms failed: {status:?}");
            return Err(status);
        }
    }

    Ok(())
}
