//! KDNET: the network kernel-debugger transport.
//!
//! When `DEBUGPORT=net` is in effect, the loader locates a debug-capable
//! NIC, fills in the debug device descriptor, loads `kdnet.dll` in place of
//! `kdcom.dll`, calls its `KdInitializeLibrary` to size the hardware
//! context, and finally (after paging is up) `KdInitializeController`.

use crate::context::BootContext;
use loader_block::layouts::{CM_RESOURCE_TYPE_MEMORY, DebugDeviceDescriptor};
use loader_pe::PeImage;
use loader_vmem::{MemoryKind, PageAllocator, PhysAddr, page_count};
use log::{info, warn};
use uefi::proto::unsafe_protocol;
use uefi::{Status, boot};

type NtStatus = i32;

/// `kd_funcs` table the stub fills in through `KdInitializeLibrary`.
#[repr(C)]
struct KdFuncs {
    count: u32,
    pad: u32,
    kd_initialize_controller: usize,
    kd_shutdown_controller: usize,
    kd_set_hibernate_range: usize,
    kd_get_rx_packet: usize,
    kd_release_rx_packet: usize,
    kd_get_tx_packet: usize,
    kd_send_tx_packet: usize,
    kd_get_packet_address: usize,
    kd_get_packet_length: usize,
    kd_get_hardware_context_size: usize,
    unknown: [usize; 3],
}

/// Import surface the stub expects from its host. Everything the loader
/// does not provide stays null; the stub only touches the PCI accessors and
/// the stall during init.
#[repr(C)]
struct KdnetExports {
    version: u32,
    pad: u32,
    funcs: *mut KdFuncs,
    exports: [usize; 32],
}

/// The state carried to the post-paging `KdInitializeController` call.
pub struct Kdnet {
    pub descriptor: DebugDeviceDescriptor,
    pub scratch: PhysAddr,
    pub scratch_pages: u64,
    initialize_library: usize,
    funcs: KdFuncs,
}

#[repr(C)]
#[unsafe_protocol("4cf5b200-68b8-4ca5-9eec-b23e3f50029a")]
struct PciIoProtocol {
    poll_mem: usize,
    poll_io: usize,
    mem_read: usize,
    mem_write: usize,
    io_read: usize,
    io_write: usize,
    pci_read: unsafe extern "efiapi" fn(
        *mut Self,
        u32,   // width (2 = u32)
        u32,   // offset
        usize, // count
        *mut core::ffi::c_void,
    ) -> Status,
    pci_write: usize,
    copy_mem: usize,
    map: usize,
    unmap: usize,
    allocate_buffer: usize,
    free_buffer: usize,
    flush: usize,
    get_location: unsafe extern "efiapi" fn(
        *mut Self,
        *mut usize, // segment
        *mut usize, // bus
        *mut usize, // device
        *mut usize, // function
    ) -> Status,
    attributes: usize,
    get_bar_attributes: usize,
    set_bar_attributes: usize,
    rom_size: u64,
    rom_image: usize,
}

fn read_config_u32(pci: &mut PciIoProtocol, offset: u32) -> Option<u32> {
    let mut value = 0u32;
    let this = core::ptr::from_mut(pci);
    let status = unsafe {
        (pci.pci_read)(this, 2, offset, 1, (&raw mut value).cast())
    };
    (status == Status::SUCCESS).then_some(value)
}

/// Find a network-class PCI function and describe it. The first NIC wins;
/// matching the registry's `dbgsettings` selection belongs to the kernel.
pub fn find_debug_device(descriptor: &mut DebugDeviceDescriptor) -> Result<(), Status> {
    let handles = boot::find_handles::<PciIoProtocol>().map_err(|e| e.status())?;

    for handle in handles {
        let Ok(mut pci) = boot::open_protocol_exclusive::<PciIoProtocol>(handle) else {
            continue;
        };

        let Some(id) = read_config_u32(&mut pci, 0) else {
            continue;
        };
        let Some(class) = read_config_u32(&mut pci, 8) else {
            continue;
        };

        // Base class 2: network controller.
        if (class >> 24) & 0xff != 2 {
            continue;
        }

        let mut segment = 0usize;
        let mut bus = 0usize;
        let mut device = 0usize;
        let mut function = 0usize;
        let this = core::ptr::from_mut(&mut *pci);
        let status = unsafe {
            (pci.get_location)(this, &mut segment, &mut bus, &mut device, &mut function)
        };
        if status != Status::SUCCESS {
            continue;
        }

        descriptor.bus = bus as u32;
        descriptor.slot = ((device << 3) | function) as u32;
        descriptor.segment = segment as u16;
        descriptor.vendor_id = (id & 0xffff) as u16;
        descriptor.device_id = (id >> 16) as u16;
        descriptor.base_class = ((class >> 24) & 0xff) as u8;
        descriptor.sub_class = ((class >> 16) & 0xff) as u8;
        descriptor.prog_if = ((class >> 8) & 0xff) as u8;
        descriptor.initialized = 0;
        descriptor.configured = 0;

        // Memory BARs straight from config space.
        for (index, bar) in descriptor.base_address.iter_mut().enumerate() {
            let Some(raw) = read_config_u32(&mut pci, 0x10 + index as u32 * 4) else {
                continue;
            };
            if raw == 0 || raw & 1 != 0 {
                // Absent or I/O space.
                continue;
            }
            bar.address_type = CM_RESOURCE_TYPE_MEMORY;
            bar.valid = 1;
            bar.translated_address = (raw & !0xf) as usize;
            bar.length = 0x1000;
        }

        info!(
            "debug NIC {:04x}:{:04x} at bus {bus} device {device} function {function}",
            descriptor.vendor_id, descriptor.device_id
        );
        return Ok(());
    }

    Err(Status::NOT_FOUND)
}

impl Kdnet {
    /// Size and allocate the transport's hardware context through the
    /// stub's `KdInitializeLibrary`, which must still be identity-mapped.
    pub fn initialize(
        ctx: &mut BootContext,
        stub: &PeImage,
        mut descriptor: DebugDeviceDescriptor,
    ) -> Result<Self, Status> {
        let mut resolve = |_: &str| None;
        let initialize_library = stub
            .find_export("KdInitializeLibrary", &mut resolve)
            .map_err(|_| Status::NOT_FOUND)? as usize;

        let mut funcs = unsafe { core::mem::zeroed::<KdFuncs>() };
        funcs.count = 13;
        let mut exports = unsafe { core::mem::zeroed::<KdnetExports>() };
        exports.version = 1;
        exports.funcs = &raw mut funcs;

        type KdInitializeLibrary = unsafe extern "win64" fn(
            *mut KdnetExports,
            *mut core::ffi::c_void,
            *mut DebugDeviceDescriptor,
        ) -> NtStatus;

        // SAFETY: the stub was relocated to its identity address; the
        // calling convention comes from the export contract.
        let status = unsafe {
            let entry: KdInitializeLibrary = core::mem::transmute(initialize_library);
            entry(&raw mut exports, core::ptr::null_mut(), &raw mut descriptor)
        };
        if status < 0 {
            warn!("KdInitializeLibrary returned {status:#x}");
            return Err(Status::DEVICE_ERROR);
        }

        type KdGetHardwareContextSize =
            unsafe extern "win64" fn(*mut DebugDeviceDescriptor) -> u64;

        let context_size = if funcs.kd_get_hardware_context_size != 0 {
            unsafe {
                let get_size: KdGetHardwareContextSize =
                    core::mem::transmute(funcs.kd_get_hardware_context_size);
                get_size(&raw mut descriptor)
            }
        } else {
            0x2000
        };

        let scratch_pages = page_count(context_size.max(0x1000));
        let scratch = ctx
            .memory
            .alloc_pages(scratch_pages)
            .ok_or(Status::OUT_OF_RESOURCES)?;

        descriptor.transport_data.hw_context_size = context_size as u32;
        descriptor.memory.virtual_address = scratch.as_u64() as usize;
        descriptor.memory.length = context_size as u32;

        Ok(Self {
            descriptor,
            scratch,
            scratch_pages,
            initialize_library,
            funcs,
        })
    }

    /// Map the MMIO BARs and the scratch buffer into the kernel range.
    pub fn map(&mut self, ctx: &mut BootContext) -> Result<(), Status> {
        for bar in &self.descriptor.base_address {
            if bar.valid != 0 && bar.address_type == CM_RESOURCE_TYPE_MEMORY {
                ctx.map_at_cursor(
                    PhysAddr::new(bar.translated_address as u64),
                    page_count(u64::from(bar.length)),
                    MemoryKind::FirmwarePermanent,
                )
                .map_err(|_| Status::OUT_OF_RESOURCES)?;
            }
        }

        ctx.map_at_cursor(
            self.scratch,
            self.scratch_pages,
            MemoryKind::FirmwarePermanent,
        )
        .map_err(|_| Status::OUT_OF_RESOURCES)?;
        Ok(())
    }

    /// Bring the controller up right before the jump (paging is on; the
    /// identity map still covers the stub).
    pub fn start_controller(&mut self) {
        if self.funcs.kd_initialize_controller == 0 {
            return;
        }

        #[repr(C)]
        struct KdNetData {
            scratch: usize,
            descriptor: *mut DebugDeviceDescriptor,
        }

        type KdInitializeController = unsafe extern "win64" fn(*mut KdNetData) -> NtStatus;

        let mut data = KdNetData {
            scratch: self.scratch.as_u64() as usize,
            descriptor: &raw mut self.descriptor,
        };

        // SAFETY: identity map still live until the kernel replaces CR3.
        let status = unsafe {
            let entry: KdInitializeController =
                core::mem::transmute(self.funcs.kd_initialize_controller);
            entry(&raw mut data)
        };
        if status < 0 {
            warn!("KdInitializeController returned {status:#x}");
        }
        let _ = self.initialize_library;
    }
}
