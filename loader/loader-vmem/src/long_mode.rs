//! Four-level (PML4) page tables for x86-64 kernels.
//!
//! The kernel half is always mapped with 4 KiB leaves so per-section
//! protection can be applied exactly; the identity map underneath the
//! loader uses 2 MiB leaves where alignment allows.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::mapping::{MappingSet, PageProtection};
use crate::page_table::{PageEntry, PageTable};
use crate::{FrameAlloc, PAGE_SIZE, PhysMapper};
use log::trace;

/// PML4 slot of the recursive self-map. The kernel expects to reach its PTEs
/// through `0xFFFFF680'00000000`, which this slot decodes to.
pub const SELF_MAP_SLOT: usize = 0x1ed;

const LARGE_PAGE: u64 = 0x20_0000;

#[derive(Debug, thiserror::Error)]
pub enum PageTableError {
    #[error("out of frames while building page tables")]
    OutOfFrames,
    #[error("attempted to map unaligned address {0}")]
    Unaligned(u64),
    #[error("no leaf mapped at {0}")]
    NotMapped(VirtAddr),
}

/// A PML4-rooted address space under construction.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    pub fn new(mapper: &'m M, alloc: &mut impl FrameAlloc) -> Result<Self, PageTableError> {
        let root = alloc.alloc_frame().ok_or(PageTableError::OutOfFrames)?;
        Ok(Self { root, mapper })
    }

    /// Physical address to load into CR3.
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    fn table(&self, pa: PhysAddr) -> &mut PageTable {
        // SAFETY: table frames come from the frame allocator and stay alive
        // for the lifetime of the address space.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    fn descend(
        &self,
        alloc: &mut impl FrameAlloc,
        table: PhysAddr,
        index: usize,
    ) -> Result<PhysAddr, PageTableError> {
        let entry = self.table(table).entries[index];
        if entry.present() {
            if entry.large() {
                // A huge leaf already covers this window; carving a 4 KiB
                // page out of it would shadow the mapping.
                return Err(PageTableError::Unaligned(entry.addr()));
            }
            return Ok(PhysAddr::new(entry.addr()));
        }

        let next = alloc.alloc_frame().ok_or(PageTableError::OutOfFrames)?;
        self.table(table).entries[index] = PageEntry::table(next.as_u64());
        Ok(next)
    }

    /// Install a single 4 KiB leaf.
    pub fn map_page(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        protection: PageProtection,
        global: bool,
    ) -> Result<(), PageTableError> {
        if va.as_u64() % PAGE_SIZE != 0 || pa.as_u64() % PAGE_SIZE != 0 {
            return Err(PageTableError::Unaligned(va.as_u64()));
        }

        let pdpt = self.descend(alloc, self.root, va.pml4_index())?;
        let pd = self.descend(alloc, pdpt, va.pdpt_index())?;
        let pt = self.descend(alloc, pd, va.pd_index())?;

        self.table(pt).entries[va.pt_index()] =
            PageEntry::leaf(pa.as_u64(), protection.write, !protection.execute, global);
        Ok(())
    }

    /// Install a 2 MiB leaf at the page-directory level.
    pub fn map_large(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        protection: PageProtection,
    ) -> Result<(), PageTableError> {
        if va.as_u64() % LARGE_PAGE != 0 || pa.as_u64() % LARGE_PAGE != 0 {
            return Err(PageTableError::Unaligned(va.as_u64()));
        }

        let pdpt = self.descend(alloc, self.root, va.pml4_index())?;
        let pd = self.descend(alloc, pdpt, va.pdpt_index())?;

        self.table(pd).entries[va.pd_index()] =
            PageEntry::leaf(pa.as_u64(), protection.write, !protection.execute, false)
                .with_large(true);
        Ok(())
    }

    /// Map `pages` 4 KiB pages starting at `va → pa`.
    pub fn map_region(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        pages: u64,
        protection: PageProtection,
        global: bool,
    ) -> Result<(), PageTableError> {
        for i in 0..pages {
            self.map_page(
                alloc,
                va.add(i * PAGE_SIZE),
                pa.add(i * PAGE_SIZE),
                protection,
                global,
            )?;
        }
        Ok(())
    }

    /// Identity-map a physical range, preferring 2 MiB leaves.
    pub fn identity_map(
        &self,
        alloc: &mut impl FrameAlloc,
        base: PhysAddr,
        pages: u64,
    ) -> Result<(), PageTableError> {
        let prot = PageProtection {
            write: true,
            execute: true,
        };

        let mut addr = base.as_u64();
        let end = base.as_u64() + pages * PAGE_SIZE;
        while addr < end {
            if addr % LARGE_PAGE == 0 && end - addr >= LARGE_PAGE {
                self.map_large(alloc, VirtAddr::new(addr), PhysAddr::new(addr), prot)?;
                addr += LARGE_PAGE;
            } else {
                self.map_page(alloc, VirtAddr::new(addr), PhysAddr::new(addr), prot, false)?;
                addr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Rewrite the access bits of already-mapped 4 KiB leaves.
    pub fn set_protection(
        &self,
        va: VirtAddr,
        pages: u64,
        protection: PageProtection,
    ) -> Result<(), PageTableError> {
        for i in 0..pages {
            let cur = va.add(i * PAGE_SIZE);
            let Some((pt, index)) = self.walk_to_pt(cur) else {
                return Err(PageTableError::NotMapped(cur));
            };
            let entry = self.table(pt).entries[index];
            if !entry.present() {
                return Err(PageTableError::NotMapped(cur));
            }
            self.table(pt).entries[index] = entry
                .with_writable(protection.write)
                .with_no_execute(!protection.execute);
        }
        Ok(())
    }

    /// Point [`SELF_MAP_SLOT`] back at the PML4 itself.
    pub fn install_self_map(&self) {
        self.table(self.root).entries[SELF_MAP_SLOT] = PageEntry::table(self.root.as_u64());
    }

    /// Translate a virtual address, following large leaves.
    #[must_use]
    pub fn query(&self, va: VirtAddr) -> Option<PhysAddr> {
        let e4 = self.table(self.root).entries[va.pml4_index()];
        if !e4.present() {
            return None;
        }
        let e3 = self.table(PhysAddr::new(e4.addr())).entries[va.pdpt_index()];
        if !e3.present() {
            return None;
        }
        if e3.large() {
            return Some(PhysAddr::new(e3.addr() + (va.as_u64() & 0x3fff_ffff)));
        }
        let e2 = self.table(PhysAddr::new(e3.addr())).entries[va.pd_index()];
        if !e2.present() {
            return None;
        }
        if e2.large() {
            return Some(PhysAddr::new(e2.addr() + (va.as_u64() & 0x1f_ffff)));
        }
        let e1 = self.table(PhysAddr::new(e2.addr())).entries[va.pt_index()];
        if !e1.present() {
            return None;
        }
        Some(PhysAddr::new(e1.addr() + (va.as_u64() & 0xfff)))
    }

    fn walk_to_pt(&self, va: VirtAddr) -> Option<(PhysAddr, usize)> {
        let e4 = self.table(self.root).entries[va.pml4_index()];
        if !e4.present() {
            return None;
        }
        let e3 = self.table(PhysAddr::new(e4.addr())).entries[va.pdpt_index()];
        if !e3.present() || e3.large() {
            return None;
        }
        let e2 = self.table(PhysAddr::new(e3.addr())).entries[va.pd_index()];
        if !e2.present() || e2.large() {
            return None;
        }
        Some((PhysAddr::new(e2.addr()), va.pt_index()))
    }
}

/// Build the final address space: the identity map the loader still runs on,
/// every mapping of the plan with kind-derived protection refined by the
/// per-section overrides, and the self-map slot.
///
/// This is the only operation that turns a [`MappingSet`] into hardware
/// state; nothing else hands out PTE pointers.
pub fn materialize<'m, M: PhysMapper>(
    mapper: &'m M,
    alloc: &mut impl FrameAlloc,
    mappings: &MappingSet,
    identity: &[(PhysAddr, u64)],
) -> Result<AddressSpace<'m, M>, PageTableError> {
    let space = AddressSpace::new(mapper, alloc)?;

    for &(base, pages) in identity {
        space.identity_map(alloc, base, pages)?;
    }

    for m in mappings.iter() {
        let Some(va) = m.va else { continue };
        space.map_region(alloc, va, m.pa, m.pages, m.kind.default_protection(), true)?;
    }

    for ov in mappings.overrides() {
        space.set_protection(ov.va, ov.pages, ov.protection)?;
    }

    space.install_self_map();
    trace!("page tables materialized, root {}", space.root());
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MemoryKind;
    use alloc::vec::Vec;

    /// Fake physical memory: a pool of 4 KiB-aligned frames, addressed by
    /// their real heap addresses so the identity-map convention holds.
    struct TestPhys {
        frames: Vec<&'static mut Frame>,
        next: usize,
    }

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(alloc::boxed::Box::leak(alloc::boxed::Box::new(Frame([0; 4096]))));
            }
            Self { frames, next: 0 }
        }
    }

    impl FrameAlloc for TestPhys {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            let frame = self.frames.get_mut(self.next)?;
            self.next += 1;
            frame.0.fill(0);
            Some(PhysAddr::new((&raw mut **frame) as u64))
        }
    }

    struct IdentityMapper;

    impl PhysMapper for IdentityMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            unsafe { &mut *(pa.as_u64() as *mut T) }
        }
    }

    #[test]
    fn map_page_creates_the_full_chain() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(16);
        let space = AddressSpace::new(&mapper, &mut alloc).unwrap();

        let va = VirtAddr::new(0xffff_f800_0000_0000);
        let pa = PhysAddr::new(0x30_0000);
        space
            .map_page(
                &mut alloc,
                va,
                pa,
                PageProtection {
                    write: true,
                    execute: false,
                },
                true,
            )
            .unwrap();

        assert_eq!(space.query(va), Some(pa));
        assert_eq!(space.query(va.add(0x123)).map(PhysAddr::as_u64), Some(0x30_0123));
        assert_eq!(space.query(VirtAddr::new(0xffff_f800_0000_1000)), None);
    }

    #[test]
    fn identity_map_uses_large_pages_where_aligned() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(16);
        let space = AddressSpace::new(&mapper, &mut alloc).unwrap();

        // 4 MiB at a 2 MiB boundary: two large leaves, no PT frames.
        let before = alloc.next;
        space
            .identity_map(&mut alloc, PhysAddr::new(0x20_0000), 1024)
            .unwrap();
        // PDPT + PD only.
        assert_eq!(alloc.next - before, 2);
        assert_eq!(
            space.query(VirtAddr::new(0x20_1234)),
            Some(PhysAddr::new(0x20_1234))
        );
    }

    #[test]
    fn materialize_covers_plan_and_applies_overrides() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(64);

        let mut plan = MappingSet::new();
        let backing = alloc.alloc_frame().unwrap();
        let va = VirtAddr::new(0xffff_f800_0020_0000);
        plan.add(Some(va), backing, 1, MemoryKind::SystemCode).unwrap();
        plan.add_protection(crate::mapping::ProtectionOverride {
            va,
            pages: 1,
            protection: PageProtection {
                write: false,
                execute: true,
            },
        });

        let space = materialize(&mapper, &mut alloc, &plan, &[(PhysAddr::new(0), 512)]).unwrap();

        assert_eq!(space.query(va), Some(backing));
        // Identity portion still translates.
        assert_eq!(space.query(VirtAddr::new(0x1000)), Some(PhysAddr::new(0x1000)));

        // Override demoted the leaf to read-only.
        let (pt, index) = space.walk_to_pt(va).unwrap();
        let entry = space.table(pt).entries[index];
        assert!(!entry.writable());
        assert!(!entry.no_execute());

        // Self-map points back at the root.
        let root_entry = space.table(space.root()).entries[SELF_MAP_SLOT];
        assert!(root_entry.present());
        assert_eq!(root_entry.addr(), space.root().as_u64());
    }
}
