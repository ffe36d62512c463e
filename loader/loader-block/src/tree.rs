//! The legacy ARC configuration tree (`CONFIGURATION_COMPONENT_DATA`),
//! built by the hardware enumerator and emitted here with parent, child and
//! sibling links.

use crate::BlockError;
use crate::fixups::FixupTable;
use crate::layouts::{ConfigurationComponent, ConfigurationComponentData};
use alloc::string::String;
use alloc::vec::Vec;
use core::mem::offset_of;
use loader_vmem::{PAGE_SIZE, PageAllocator, PhysAddr, page_count};

/// `CONFIGURATION_CLASS` values.
pub const CLASS_SYSTEM: u32 = 0;
pub const CLASS_PROCESSOR: u32 = 1;
pub const CLASS_CACHE: u32 = 2;
pub const CLASS_ADAPTER: u32 = 3;
pub const CLASS_CONTROLLER: u32 = 4;
pub const CLASS_PERIPHERAL: u32 = 5;

/// `CONFIGURATION_TYPE` values of interest.
pub const TYPE_ARC_SYSTEM: u32 = 0;
pub const TYPE_CENTRAL_PROCESSOR: u32 = 1;
pub const TYPE_FLOATING_POINT_PROCESSOR: u32 = 2;
pub const TYPE_MULTI_FUNCTION_ADAPTER: u32 = 26;
pub const TYPE_DISK_CONTROLLER: u32 = 28;
pub const TYPE_DISK_PERIPHERAL: u32 = 38;

/// One node of the tree under construction.
pub struct ConfigNode {
    pub class: u32,
    pub component_type: u32,
    pub flags: u32,
    pub key: u32,
    pub affinity_mask: u32,
    pub identifier: Option<String>,
    pub configuration_data: Vec<u8>,
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    #[must_use]
    pub fn new(class: u32, component_type: u32) -> Self {
        Self {
            class,
            component_type,
            flags: 0,
            key: 0,
            affinity_mask: 0xffff_ffff,
            identifier: None,
            configuration_data: Vec::new(),
            children: Vec::new(),
        }
    }

    fn byte_len(&self) -> u64 {
        let mut bytes = size_of::<ConfigurationComponentData>() as u64 + 8;
        if let Some(id) = &self.identifier {
            bytes += id.len() as u64 + 1 + 8;
        }
        bytes += self.configuration_data.len() as u64 + 8;
        for child in &self.children {
            bytes += child.byte_len();
        }
        bytes
    }
}

struct TreeEmitter<'a> {
    cursor: u64,
    end: u64,
    fixups: &'a mut FixupTable,
}

impl TreeEmitter<'_> {
    fn take(&mut self, bytes: u64, align: u64) -> Result<PhysAddr, BlockError> {
        let at = (self.cursor + align - 1) & !(align - 1);
        if at + bytes > self.end {
            return Err(BlockError::OutOfMemory);
        }
        self.cursor = at + bytes;
        Ok(PhysAddr::new(at))
    }

    fn emit(&mut self, node: &ConfigNode, parent: Option<PhysAddr>) -> Result<PhysAddr, BlockError> {
        let record = self.take(size_of::<ConfigurationComponentData>() as u64, 8)?;

        let mut component = ConfigurationComponent {
            class: node.class,
            component_type: node.component_type,
            flags: node.flags,
            version: 0,
            revision: 0,
            key: node.key,
            affinity_mask: node.affinity_mask,
            configuration_data_length: node.configuration_data.len() as u32,
            identifier_length: 0,
        };

        let write_ptr = |at: PhysAddr, offset: usize, value: usize| unsafe {
            core::ptr::write_unaligned((at.as_u64() as usize + offset) as *mut usize, value);
        };

        if let Some(parent) = parent {
            write_ptr(
                record,
                offset_of!(ConfigurationComponentData, parent),
                parent.as_u64() as usize,
            );
            self.fixups
                .register(record.add(offset_of!(ConfigurationComponentData, parent) as u64));
        }

        if let Some(identifier) = &node.identifier {
            component.identifier_length = identifier.len() as u32 + 1;
            let text = self.take(identifier.len() as u64 + 1, 1)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    identifier.as_ptr(),
                    text.as_u64() as *mut u8,
                    identifier.len(),
                );
            }
            write_ptr(
                record,
                offset_of!(ConfigurationComponentData, identifier),
                text.as_u64() as usize,
            );
            self.fixups
                .register(record.add(offset_of!(ConfigurationComponentData, identifier) as u64));
        }

        if !node.configuration_data.is_empty() {
            let data = self.take(node.configuration_data.len() as u64, 8)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    node.configuration_data.as_ptr(),
                    data.as_u64() as *mut u8,
                    node.configuration_data.len(),
                );
            }
            write_ptr(
                record,
                offset_of!(ConfigurationComponentData, configuration_data),
                data.as_u64() as usize,
            );
            self.fixups.register(
                record.add(offset_of!(ConfigurationComponentData, configuration_data) as u64),
            );
        }

        unsafe {
            core::ptr::write_unaligned(
                (record.as_u64() as usize
                    + offset_of!(ConfigurationComponentData, component_entry))
                    as *mut ConfigurationComponent,
                component,
            );
        }

        // Children chain through `child` (first) and `sibling` (rest).
        let mut previous: Option<PhysAddr> = None;
        for child in &node.children {
            let child_record = self.emit(child, Some(record))?;
            match previous {
                None => {
                    write_ptr(
                        record,
                        offset_of!(ConfigurationComponentData, child),
                        child_record.as_u64() as usize,
                    );
                    self.fixups.register(
                        record.add(offset_of!(ConfigurationComponentData, child) as u64),
                    );
                }
                Some(previous) => {
                    write_ptr(
                        previous,
                        offset_of!(ConfigurationComponentData, sibling),
                        child_record.as_u64() as usize,
                    );
                    self.fixups.register(
                        previous.add(offset_of!(ConfigurationComponentData, sibling) as u64),
                    );
                }
            }
            previous = Some(child_record);
        }

        Ok(record)
    }
}

/// Emit the whole tree into one allocation; returns the root record and the
/// backing pages.
pub fn write_configuration_tree(
    root: &ConfigNode,
    alloc: &mut dyn PageAllocator,
    fixups: &mut FixupTable,
) -> Result<(PhysAddr, PhysAddr, u64), BlockError> {
    let pages = page_count(root.byte_len());
    let base = alloc.alloc_pages(pages).ok_or(BlockError::OutOfMemory)?;
    unsafe {
        core::ptr::write_bytes(base.as_ptr(), 0, (pages * PAGE_SIZE) as usize);
    }

    let mut emitter = TreeEmitter {
        cursor: base.as_u64(),
        end: base.as_u64() + pages * PAGE_SIZE,
        fixups,
    };
    let root_record = emitter.emit(root, None)?;
    Ok((root_record, base, pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_vmem::{MappingSet, MemoryKind, VirtAddr};

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

    unsafe fn read_usize(at: PhysAddr, offset: usize) -> usize {
        unsafe { core::ptr::read_unaligned((at.as_u64() as usize + offset) as *const usize) }
    }

    #[test]
    fn tree_links_parent_child_sibling() {
        let mut root = ConfigNode::new(CLASS_SYSTEM, TYPE_ARC_SYSTEM);
        root.identifier = Some(String::from("PCI-Compatible Sys"));

        let mut adapter = ConfigNode::new(CLASS_ADAPTER, TYPE_MULTI_FUNCTION_ADAPTER);
        adapter.children.push(ConfigNode::new(
            CLASS_CONTROLLER,
            TYPE_DISK_CONTROLLER,
        ));
        root.children.push(adapter);
        root.children
            .push(ConfigNode::new(CLASS_PROCESSOR, TYPE_CENTRAL_PROCESSOR));

        let mut alloc = TestAlloc;
        let mut fixups = FixupTable::new();
        let (root_record, base, pages) =
            write_configuration_tree(&root, &mut alloc, &mut fixups).unwrap();

        unsafe {
            let child =
                read_usize(root_record, offset_of!(ConfigurationComponentData, child)) as u64;
            assert_ne!(child, 0);

            let adapter = PhysAddr::new(child);
            let sibling =
                read_usize(adapter, offset_of!(ConfigurationComponentData, sibling)) as u64;
            assert_ne!(sibling, 0);

            let grandchild =
                read_usize(adapter, offset_of!(ConfigurationComponentData, child)) as u64;
            let parent_of_grandchild = read_usize(
                PhysAddr::new(grandchild),
                offset_of!(ConfigurationComponentData, parent),
            ) as u64;
            assert_eq!(parent_of_grandchild, adapter.as_u64());
        }

        // Every registered pointer resolves after mapping the allocation.
        let mut mappings = MappingSet::new();
        mappings
            .add(
                Some(VirtAddr::new(0xffff_f800_3000_0000)),
                base,
                pages,
                MemoryKind::SystemBlock,
            )
            .unwrap();
        let rewritten = unsafe { fixups.emit(&mappings).unwrap() };
        assert!(rewritten >= 5);

        unsafe {
            let child =
                read_usize(root_record, offset_of!(ConfigurationComponentData, child)) as u64;
            assert_eq!(child >> 32, 0xffff_f800);
        }
    }
}
