//! Volume and file access.
//!
//! The boot volume is found either by conventional ARC name (matching the
//! firmware's block devices) or through the loader-specific volume-info
//! protocol a filesystem driver such as the Btrfs one publishes. File opens
//! retry case-insensitively component by component, because NT image paths
//! arrive in whatever case the registry recorded while the backing store
//! may be case-sensitive.

use crate::hw;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use loader_images::{ImageError, ImageSource};
use loader_options::ArcPartition;
use log::{info, warn};
use uefi::proto::media::file::{Directory, File, FileAttribute, FileHandle, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::proto::unsafe_protocol;
use uefi::{CString16, Char16, Handle, Status, boot};

/// Loader-specific volume information published by snapshot-aware
/// filesystem drivers.
#[repr(C)]
#[unsafe_protocol("98bcc8ff-d212-4b09-840c-4319ad2ed36a")]
pub struct VolumeInfoProtocol {
    get_arc_name:
        unsafe extern "efiapi" fn(*mut Self, *mut u8, *mut usize) -> Status,
    get_windows_driver_name:
        unsafe extern "efiapi" fn(*mut Self, *mut Char16, *mut usize) -> Status,
}

impl VolumeInfoProtocol {
    /// The driver-reported ARC name, e.g. `btrfs(<uuid>)`.
    pub fn arc_name(&mut self) -> Option<String> {
        let this = core::ptr::from_mut(self);
        let mut len = 0usize;
        let status = unsafe { (self.get_arc_name)(this, core::ptr::null_mut(), &mut len) };
        if status != Status::BUFFER_TOO_SMALL || len == 0 {
            return None;
        }

        let mut buffer = vec![0u8; len];
        let status = unsafe { (self.get_arc_name)(this, buffer.as_mut_ptr(), &mut len) };
        if status != Status::SUCCESS {
            return None;
        }
        buffer.truncate(len);
        Some(buffer.iter().take_while(|&&b| b != 0).map(|&b| b as char).collect())
    }

    /// Name of the boot-start filesystem service for this volume (selected
    /// from the registry regardless of its `Start` value).
    pub fn windows_driver_name(&mut self) -> Option<String> {
        let this = core::ptr::from_mut(self);
        let mut len = 0usize;
        let status =
            unsafe { (self.get_windows_driver_name)(this, core::ptr::null_mut(), &mut len) };
        if status != Status::BUFFER_TOO_SMALL || len == 0 {
            return None;
        }

        let mut buffer = vec![0u16; len];
        let status = unsafe {
            (self.get_windows_driver_name)(this, buffer.as_mut_ptr().cast(), &mut len)
        };
        if status != Status::SUCCESS {
            return None;
        }

        Some(
            char::decode_utf16(buffer.into_iter().take_while(|&u| u != 0))
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        )
    }
}

/// Snapshot-aware root opening (`SUBVOL=`).
#[repr(C)]
#[unsafe_protocol("5861e4d5-c7f1-4932-a081-f22aae8a8298")]
pub struct OpenSubvolProtocol {
    open_subvol: unsafe extern "efiapi" fn(*mut Self, u64, *mut *mut core::ffi::c_void) -> Status,
}

/// Read a file from the volume this loader was started from.
pub fn load_boot_file(path: &uefi::CStr16) -> Result<Vec<u8>, Status> {
    let mut fs = boot::get_image_file_system(boot::image_handle())
        .map_err(|_| Status::UNSUPPORTED)?;
    let mut volume = fs.open_volume().map_err(|_| Status::UNSUPPORTED)?;

    let handle = volume
        .open(path, FileMode::Read, FileAttribute::empty())
        .map_err(|e| e.status())?;
    let Some(file) = handle.into_regular_file() else {
        return Err(Status::UNSUPPORTED);
    };
    read_regular_file(file).ok_or(Status::UNSUPPORTED)
}

/// The opened boot volume plus the identity the kernel will know it by.
pub struct BootVolume {
    pub root: Directory,
    /// Canonical ARC name for the loader block and the disk list.
    pub arc_name: String,
    /// Filesystem driver the volume wants selected from the registry.
    pub fs_driver: Option<String>,
}

/// Resolve the volume part of a `SystemPath` to an open root directory.
pub fn open_boot_volume(volume_name: &str, subvol: u64) -> Result<BootVolume, Status> {
    let handle = find_volume_handle(volume_name)?;

    // The driver knows the authoritative ARC name and which Windows
    // filesystem service it needs; a conventional volume has neither.
    let mut arc_name = String::from(volume_name);
    let mut fs_driver = None;
    if let Ok(mut info) = boot::open_protocol_exclusive::<VolumeInfoProtocol>(handle) {
        if let Some(name) = info.arc_name() {
            info!("ARC name is {name}");
            arc_name = name;
        }
        fs_driver = info.windows_driver_name();
    }

    let root = open_volume_root(handle, subvol)?;
    Ok(BootVolume {
        root,
        arc_name,
        fs_driver,
    })
}

fn find_volume_handle(volume_name: &str) -> Result<Handle, Status> {
    if let Some(partition) = ArcPartition::parse(volume_name) {
        // Conventional device: match the firmware's disk numbering.
        for device in hw::block_devices() {
            if device.disk == partition.disk && device.partition == partition.partition {
                return Ok(device.handle);
            }
        }
        warn!(
            "could not find partition {} on disk {}",
            partition.partition, partition.disk
        );
        return Err(Status::NOT_FOUND);
    }

    // Ask every volume-info-capable driver for its ARC name.
    let handles =
        boot::find_handles::<VolumeInfoProtocol>().map_err(|_| Status::NOT_FOUND)?;
    for handle in handles {
        let Ok(mut info) = boot::open_protocol_exclusive::<VolumeInfoProtocol>(handle) else {
            continue;
        };
        if info
            .arc_name()
            .is_some_and(|name| name.eq_ignore_ascii_case(volume_name))
        {
            return Ok(handle);
        }
    }

    warn!("unable to parse ARC name {volume_name}");
    Err(Status::NOT_FOUND)
}

fn open_volume_root(handle: Handle, subvol: u64) -> Result<Directory, Status> {
    if subvol != 0 {
        match boot::open_protocol_exclusive::<OpenSubvolProtocol>(handle) {
            Ok(mut proto) => {
                let mut file: *mut core::ffi::c_void = core::ptr::null_mut();
                let this = core::ptr::from_mut(&mut *proto);
                let status = unsafe { (proto.open_subvol)(this, subvol, &mut file) };
                if status == Status::SUCCESS && !file.is_null() {
                    // SAFETY: the driver hands back an `EFI_FILE_PROTOCOL`
                    // opened on the requested subvolume root; the handle
                    // wrapper is a transparent pointer.
                    let handle = unsafe { core::mem::transmute::<_, FileHandle>(file) };
                    if let Some(dir) = handle.into_directory() {
                        return Ok(dir);
                    }
                }
                warn!("OpenSubvol({subvol:#x}) failed ({status:?}); using default subvolume");
            }
            Err(_) => {
                warn!("filesystem driver has no subvolume support");
            }
        }
    }

    let mut fs = boot::open_protocol_exclusive::<SimpleFileSystem>(handle)
        .map_err(|e| e.status())?;
    fs.open_volume().map_err(|e| e.status())
}

/// Open a backslash-separated path, retrying each component with a
/// case-insensitive directory scan when the exact open fails.
pub fn open_file(dir: &mut Directory, path: &str) -> Result<Option<FileHandle>, Status> {
    // Fast path: one exact open of the whole path.
    if let Ok(name) = CString16::try_from(path) {
        match dir.open(&name, FileMode::Read, FileAttribute::empty()) {
            Ok(handle) => return Ok(Some(handle)),
            Err(e) if e.status() != Status::NOT_FOUND => return Err(e.status()),
            Err(_) => {}
        }
    }

    let mut components = path.split('\\').filter(|c| !c.is_empty()).peekable();
    let mut walked: Option<Directory> = None;

    while let Some(component) = components.next() {
        let parent: &mut Directory = walked.as_mut().unwrap_or(dir);

        let Some(next) = open_component(parent, component)? else {
            return Ok(None);
        };

        if components.peek().is_none() {
            return Ok(Some(next));
        }

        // An intermediate component that is not a directory is a miss.
        let Some(next_dir) = next.into_directory() else {
            return Ok(None);
        };
        walked = Some(next_dir);
    }

    Ok(None)
}

fn open_component(dir: &mut Directory, component: &str) -> Result<Option<FileHandle>, Status> {
    let Ok(name) = CString16::try_from(component) else {
        return Ok(None);
    };

    match dir.open(&name, FileMode::Read, FileAttribute::empty()) {
        Ok(handle) => return Ok(Some(handle)),
        Err(e) if e.status() != Status::NOT_FOUND => return Err(e.status()),
        Err(_) => {}
    }

    // Scan the directory for a case-insensitive match.
    dir.reset_entry_readout().map_err(|e| e.status())?;
    let mut buffer = vec![0u8; 1024];
    loop {
        match dir.read_entry(&mut buffer) {
            Ok(Some(entry)) => {
                let file_name = entry.file_name();
                if utf16_eq_ignore_ascii_case(file_name, component) {
                    let owned = CString16::from(file_name);
                    return dir
                        .open(&owned, FileMode::Read, FileAttribute::empty())
                        .map(Some)
                        .map_err(|e| e.status());
                }
            }
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.status()),
        }
    }
}

fn utf16_eq_ignore_ascii_case(name: &uefi::CStr16, other: &str) -> bool {
    let mut units = name.iter();
    let mut bytes = other.bytes();
    loop {
        match (units.next(), bytes.next()) {
            (None, None) => return true,
            (Some(&unit), Some(byte)) => {
                let unit = u16::from(unit);
                let folded = if (0x41..=0x5a).contains(&unit) {
                    unit + 0x20
                } else {
                    unit
                };
                if folded != u16::from(byte.to_ascii_lowercase()) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn read_regular_file(mut file: RegularFile) -> Option<Vec<u8>> {
    file.set_position(RegularFile::END_OF_FILE).ok()?;
    let size = file.get_position().ok()?;
    file.set_position(0).ok()?;

    let size = usize::try_from(size).ok()?;
    let mut data = vec![0u8; size];
    let read = file.read(&mut data).ok()?;
    if read != size {
        warn!("short read: {read} of {size} bytes");
        return None;
    }
    Some(data)
}

/// Read a whole file below `dir`; `Ok(None)` when it does not exist.
pub fn read_file(dir: &mut Directory, path: &str) -> Result<Option<Vec<u8>>, Status> {
    let Some(handle) = open_file(dir, path)? else {
        return Ok(None);
    };
    let Some(file) = handle.into_regular_file() else {
        return Err(Status::UNSUPPORTED);
    };
    read_regular_file(file).map(Some).ok_or(Status::DEVICE_ERROR)
}

/// [`ImageSource`] rooted at the Windows directory of the boot volume.
pub struct WindowsVolume<'a> {
    pub root: &'a mut Directory,
    pub windows_path: String,
}

impl ImageSource for WindowsVolume<'_> {
    fn read(&mut self, dir: &str, name: &str) -> Result<Option<Vec<u8>>, ImageError> {
        let path = format!("{}\\{}\\{}", self.windows_path, dir, name);
        read_file(self.root, &path)
            .map_err(|status| ImageError::NotFound(format!("{path} ({status:?})")))
    }
}
