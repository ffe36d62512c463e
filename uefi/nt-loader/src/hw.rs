//! Hardware enumeration: block devices for ARC resolution and the disk
//! signature list, plus the legacy configuration tree the kernel expects.
//!
//! The deep PCI walk belongs to the out-of-scope hardware enumerator; this
//! builds the tree from what the firmware readily reports.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use loader_block::entries::ArcDiskEntry;
use loader_block::tree::{
    CLASS_ADAPTER, CLASS_CONTROLLER, CLASS_PERIPHERAL, CLASS_PROCESSOR, CLASS_SYSTEM,
    ConfigNode, TYPE_ARC_SYSTEM, TYPE_CENTRAL_PROCESSOR, TYPE_DISK_CONTROLLER,
    TYPE_DISK_PERIPHERAL, TYPE_MULTI_FUNCTION_ADAPTER,
};
use loader_options::ArcPartition;
use log::{info, warn};
use uefi::proto::device_path::{DevicePath, DeviceSubType, DeviceType};
use uefi::proto::media::block::BlockIO;
use uefi::{Handle, boot};

/// One partition as the firmware sees it.
pub struct BlockDevice {
    pub handle: Handle,
    pub disk: u32,
    pub partition: u32,
    pub signature: u32,
    pub is_gpt: bool,
    pub gpt_signature: [u8; 16],
}

/// Enumerate partition handles and assign NT-style `(disk, partition)`
/// numbering: disks in firmware discovery order, partition numbers from the
/// hard-drive device-path node.
#[must_use]
pub fn block_devices() -> Vec<BlockDevice> {
    let mut devices = Vec::new();
    let Ok(handles) = boot::find_handles::<BlockIO>() else {
        return devices;
    };

    // Paths of the parent disks, in discovery order; index = disk number.
    let mut disks: Vec<Vec<u8>> = Vec::new();

    for handle in handles {
        let Ok(path) = boot::open_protocol_exclusive::<DevicePath>(handle) else {
            continue;
        };

        let mut parent = Vec::new();
        let mut hard_drive = None;
        for node in path.node_iter() {
            if node.device_type() == DeviceType::MEDIA
                && node.sub_type() == DeviceSubType::MEDIA_HARD_DRIVE
            {
                hard_drive = Some(node.data().to_vec());
                break;
            }
            parent.extend_from_slice(node.data());
            parent.push(node.device_type().0);
            parent.push(node.sub_type().0);
        }

        // Whole-disk handles (no hard-drive node) only establish numbering.
        let Some(hard_drive) = hard_drive else {
            if !disks.iter().any(|d| *d == parent) {
                disks.push(parent);
            }
            continue;
        };

        let disk = match disks.iter().position(|d| *d == parent) {
            Some(index) => index as u32,
            None => {
                disks.push(parent);
                (disks.len() - 1) as u32
            }
        };

        // MEDIA_HARD_DRIVE node payload (after the 4-byte header):
        // partition number, start, size, 16-byte signature, MBR/GPT type,
        // signature type.
        if hard_drive.len() < 38 {
            continue;
        }
        let partition =
            u32::from_le_bytes([hard_drive[0], hard_drive[1], hard_drive[2], hard_drive[3]]);
        let mut signature16 = [0u8; 16];
        signature16.copy_from_slice(&hard_drive[20..36]);
        let signature_type = hard_drive[37];

        let is_gpt = signature_type == 2;
        let signature = u32::from_le_bytes([
            signature16[0],
            signature16[1],
            signature16[2],
            signature16[3],
        ]);

        devices.push(BlockDevice {
            handle,
            disk,
            partition,
            signature,
            is_gpt,
            gpt_signature: signature16,
        });
    }

    info!("found {} partitions", devices.len());
    devices
}

/// The disk signature list for the loader block. The boot volume's entry
/// must carry exactly the ARC name the block advertises.
#[must_use]
pub fn arc_disk_entries(devices: &[BlockDevice], boot_arc_name: &str) -> Vec<ArcDiskEntry> {
    let boot_partition = ArcPartition::parse(boot_arc_name);
    let mut entries = Vec::with_capacity(devices.len());

    for device in devices {
        let here = ArcPartition {
            disk: device.disk,
            partition: device.partition,
        };
        let arc_name = if boot_partition.is_none()
            && devices.len() == 1
        {
            // Sole non-conventional volume: the driver-reported name.
            String::from(boot_arc_name)
        } else if boot_partition == Some(here) {
            String::from(boot_arc_name)
        } else {
            here.format()
        };

        entries.push(ArcDiskEntry {
            arc_name,
            signature: device.signature,
            check_sum: device.signature.wrapping_neg(),
            valid_partition_table: true,
            is_gpt: device.is_gpt,
            gpt_signature: device.gpt_signature,
        });
    }

    if entries.is_empty() {
        warn!("no block devices for the ARC disk list");
    }
    entries
}

/// Build the legacy hardware tree: system root, one multifunction adapter,
/// a processor, and a disk controller with one peripheral per disk.
#[must_use]
pub fn build_configuration_tree(devices: &[BlockDevice]) -> ConfigNode {
    let mut root = ConfigNode::new(CLASS_SYSTEM, TYPE_ARC_SYSTEM);
    root.identifier = Some(String::from("ACPI UEFI"));

    let mut processor = ConfigNode::new(CLASS_PROCESSOR, TYPE_CENTRAL_PROCESSOR);
    processor.key = 0;
    root.children.push(processor);

    let mut adapter = ConfigNode::new(CLASS_ADAPTER, TYPE_MULTI_FUNCTION_ADAPTER);
    adapter.identifier = Some(String::from("PCI"));

    let mut controller = ConfigNode::new(CLASS_CONTROLLER, TYPE_DISK_CONTROLLER);
    controller.affinity_mask = 0xffff_ffff;

    let mut seen = Vec::new();
    for device in devices {
        if seen.contains(&device.disk) {
            continue;
        }
        seen.push(device.disk);

        let mut disk = ConfigNode::new(CLASS_PERIPHERAL, TYPE_DISK_PERIPHERAL);
        disk.key = device.disk;
        disk.identifier = Some(format!("rdisk({})", device.disk));
        controller.children.push(disk);
    }

    adapter.children.push(controller);
    root.children.push(adapter);
    root
}
