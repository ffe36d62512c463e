//! Doubly-linked `LIST_ENTRY` manipulation in identity-mapped memory.
//!
//! Links are written as physical pointers and every touched slot is
//! registered with the [`FixupTable`], so the final emission pass turns the
//! whole list virtual in one sweep.

use crate::fixups::FixupTable;
use crate::layouts::ListEntry;
use loader_vmem::PhysAddr;

const PTR: u64 = size_of::<usize>() as u64;

unsafe fn read_ptr(at: PhysAddr) -> usize {
    unsafe { core::ptr::read_unaligned(at.as_u64() as *const usize) }
}

unsafe fn write_ptr(at: PhysAddr, value: usize) {
    unsafe { core::ptr::write_unaligned(at.as_u64() as *mut usize, value) }
}

/// Make `head` an empty list (both links point at the head itself).
///
/// # Safety
/// `head` must point at a writable `ListEntry`.
pub unsafe fn init_list_head(head: PhysAddr, fixups: &mut FixupTable) {
    unsafe {
        write_ptr(head, head.as_u64() as usize);
        write_ptr(head.add(PTR), head.as_u64() as usize);
    }
    fixups.register(head);
    fixups.register(head.add(PTR));
}

/// Append `entry` at the tail of the list rooted at `head`.
///
/// # Safety
/// Both must point at writable `ListEntry` records; `head` must have been
/// initialized with [`init_list_head`].
pub unsafe fn insert_tail(head: PhysAddr, entry: PhysAddr, fixups: &mut FixupTable) {
    unsafe {
        let old_tail = read_ptr(head.add(PTR)) as u64;

        write_ptr(entry, head.as_u64() as usize); // entry.flink
        write_ptr(entry.add(PTR), old_tail as usize); // entry.blink
        write_ptr(PhysAddr::new(old_tail), entry.as_u64() as usize); // tail.flink
        write_ptr(head.add(PTR), entry.as_u64() as usize); // head.blink
    }
    fixups.register(entry);
    fixups.register(entry.add(PTR));
}

/// Walk the physical list, yielding each entry address.
///
/// # Safety
/// The list must be well-formed and still physical (pre-emission).
pub unsafe fn for_each(head: PhysAddr, mut f: impl FnMut(PhysAddr)) {
    let mut cursor = unsafe { read_ptr(head) } as u64;
    while cursor != head.as_u64() {
        f(PhysAddr::new(cursor));
        cursor = unsafe { read_ptr(PhysAddr::new(cursor)) } as u64;
    }
}

/// Number of entries currently linked.
///
/// # Safety
/// As for [`for_each`].
#[must_use]
pub unsafe fn list_len(head: PhysAddr) -> usize {
    let mut n = 0;
    unsafe { for_each(head, |_| n += 1) };
    n
}

/// Physical address of a `ListEntry` field given its container base.
#[must_use]
pub const fn entry_in(container: PhysAddr, offset: usize) -> PhysAddr {
    container.add(offset as u64)
}

const _: () = assert!(size_of::<ListEntry>() == 2 * size_of::<usize>());

#[cfg(test)]
mod tests {
    use super::*;
    use loader_vmem::{MappingSet, MemoryKind, VirtAddr};

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    #[test]
    fn build_and_emit_a_list() {
        let page = alloc::boxed::Box::leak(alloc::boxed::Box::new(Page([0; 4096])));
        let base = PhysAddr::new((&raw mut *page) as u64);

        let head = base;
        let a = base.add(0x100);
        let b = base.add(0x200);

        let mut fixups = FixupTable::new();
        unsafe {
            init_list_head(head, &mut fixups);
            insert_tail(head, a, &mut fixups);
            insert_tail(head, b, &mut fixups);

            assert_eq!(list_len(head), 2);
            let mut seen = alloc::vec::Vec::new();
            for_each(head, |e| seen.push(e));
            assert_eq!(seen, [a, b]);
        }

        // Map the page and emit; links must become virtual.
        let va = 0xffff_f800_4000_0000u64;
        let mut mappings = MappingSet::new();
        mappings
            .add(Some(VirtAddr::new(va)), base, 1, MemoryKind::SystemBlock)
            .unwrap();

        let rewritten = unsafe { fixups.emit(&mappings).unwrap() };
        // head(2) + two entries(2 each); head.blink/tail.flink were
        // re-registered, not duplicated.
        assert_eq!(rewritten, 6);

        unsafe {
            let head_flink = read_ptr(head) as u64;
            assert_eq!(head_flink, va + 0x100);
            let a_flink = read_ptr(a) as u64;
            assert_eq!(a_flink, va + 0x200);
            let b_flink = read_ptr(b) as u64;
            assert_eq!(b_flink, va);
            let head_blink = read_ptr(head.add(PTR)) as u64;
            assert_eq!(head_blink, va + 0x200);
        }
    }
}
