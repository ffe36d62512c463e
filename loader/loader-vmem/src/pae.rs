//! Three-level PAE tables for x86 kernels with large-address-aware builds.
//!
//! Entries share the 8-byte layout of long mode; the root is a 32-byte
//! page-directory-pointer table with four entries, and NX is honoured only
//! when the kernel asked for it.

use crate::addresses::PhysAddr;
use crate::mapping::{MappingSet, PageProtection};
use crate::page_table::{PageEntry, PageTable};
use crate::{FrameAlloc, PAGE_SIZE, PhysMapper};

/// Page-directory slots inside the 0xC0000000 directory that expose the four
/// page directories themselves, giving the kernel its PTE window.
pub const SELF_MAP_BASE_SLOT: usize = 0x300 & 0x1ff;

#[derive(Debug, thiserror::Error)]
pub enum PaeError {
    #[error("out of frames while building PAE tables")]
    OutOfFrames,
    #[error("attempted to map unaligned address {0:#x}")]
    Unaligned(u64),
}

/// A PAE address space: one PDPT frame whose first 32 bytes are the root,
/// plus four pre-allocated page directories.
pub struct PaeSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    directories: [PhysAddr; 4],
    mapper: &'m M,
    nx_enabled: bool,
}

const fn pdpt_index(va: u32) -> usize {
    (va >> 30) as usize
}

const fn pd_index(va: u32) -> usize {
    ((va >> 21) & 0x1ff) as usize
}

const fn pt_index(va: u32) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

impl<'m, M: PhysMapper> PaeSpace<'m, M> {
    /// Allocate the PDPT and all four page directories up front; PAE PDPT
    /// entries carry no access bits, so there is nothing to populate lazily.
    pub fn new(
        mapper: &'m M,
        alloc: &mut impl FrameAlloc,
        nx_enabled: bool,
    ) -> Result<Self, PaeError> {
        let root = alloc.alloc_frame().ok_or(PaeError::OutOfFrames)?;
        let mut directories = [PhysAddr::new(0); 4];
        for (i, slot) in directories.iter_mut().enumerate() {
            let pd = alloc.alloc_frame().ok_or(PaeError::OutOfFrames)?;
            *slot = pd;
            // PDPTEs only take the present bit and the address.
            let table = unsafe { mapper.phys_to_mut::<PageTable>(root) };
            table.entries[i] = PageEntry::new().with_present(true).with_frame(pd.as_u64() >> 12);
        }
        Ok(Self {
            root,
            directories,
            mapper,
            nx_enabled,
        })
    }

    /// Physical address to load into CR3 (the PDPT).
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    fn table(&self, pa: PhysAddr) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    fn leaf(&self, pa: u64, protection: PageProtection, global: bool) -> PageEntry {
        PageEntry::leaf(
            pa,
            protection.write,
            self.nx_enabled && !protection.execute,
            global,
        )
    }

    pub fn map_page(
        &self,
        alloc: &mut impl FrameAlloc,
        va: u32,
        pa: PhysAddr,
        protection: PageProtection,
        global: bool,
    ) -> Result<(), PaeError> {
        if u64::from(va) % PAGE_SIZE != 0 || pa.as_u64() % PAGE_SIZE != 0 {
            return Err(PaeError::Unaligned(va.into()));
        }

        let pd = self.directories[pdpt_index(va)];
        let pde = self.table(pd).entries[pd_index(va)];
        let pt = if pde.present() {
            PhysAddr::new(pde.addr())
        } else {
            let pt = alloc.alloc_frame().ok_or(PaeError::OutOfFrames)?;
            self.table(pd).entries[pd_index(va)] = PageEntry::table(pt.as_u64());
            pt
        };

        self.table(pt).entries[pt_index(va)] = self.leaf(pa.as_u64(), protection, global);
        Ok(())
    }

    /// Identity-map a physical range with 2 MiB leaves where aligned.
    pub fn identity_map(
        &self,
        alloc: &mut impl FrameAlloc,
        base: PhysAddr,
        pages: u64,
    ) -> Result<(), PaeError> {
        let prot = PageProtection {
            write: true,
            execute: true,
        };
        let mut addr = base.as_u64();
        let end = base.as_u64() + pages * PAGE_SIZE;
        while addr < end {
            if addr % 0x20_0000 == 0 && end - addr >= 0x20_0000 {
                let va = addr as u32;
                let pd = self.directories[pdpt_index(va)];
                self.table(pd).entries[pd_index(va)] =
                    self.leaf(addr, prot, false).with_large(true);
                addr += 0x20_0000;
            } else {
                self.map_page(alloc, addr as u32, PhysAddr::new(addr), prot, false)?;
                addr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Expose the four page directories through the 0xC0000000 window.
    pub fn install_self_map(&self) {
        let pd3 = self.directories[3];
        for (i, pd) in self.directories.iter().enumerate() {
            self.table(pd3).entries[SELF_MAP_BASE_SLOT + i] = PageEntry::table(pd.as_u64());
        }
    }

    #[must_use]
    pub fn query(&self, va: u32) -> Option<PhysAddr> {
        let pd = self.directories[pdpt_index(va)];
        let pde = self.table(pd).entries[pd_index(va)];
        if !pde.present() {
            return None;
        }
        if pde.large() {
            return Some(PhysAddr::new(pde.addr() + u64::from(va & 0x1f_ffff)));
        }
        let pte = self.table(PhysAddr::new(pde.addr())).entries[pt_index(va)];
        if !pte.present() {
            return None;
        }
        Some(PhysAddr::new(pte.addr() + u64::from(va & 0xfff)))
    }
}

/// PAE counterpart of [`crate::long_mode::materialize`].
pub fn materialize<'m, M: PhysMapper>(
    mapper: &'m M,
    alloc: &mut impl FrameAlloc,
    mappings: &MappingSet,
    identity: &[(PhysAddr, u64)],
    nx_enabled: bool,
) -> Result<PaeSpace<'m, M>, PaeError> {
    let space = PaeSpace::new(mapper, alloc, nx_enabled)?;

    for &(base, pages) in identity {
        space.identity_map(alloc, base, pages)?;
    }

    for m in mappings.iter() {
        let Some(va) = m.va else { continue };
        let prot = m.kind.default_protection();
        for i in 0..m.pages {
            space.map_page(
                alloc,
                (va.as_u64() + i * PAGE_SIZE) as u32,
                m.pa.add(i * PAGE_SIZE),
                prot,
                true,
            )?;
        }
    }

    for ov in mappings.overrides() {
        for i in 0..ov.pages {
            let va = (ov.va.as_u64() + i * PAGE_SIZE) as u32;
            if let Some(pa) = space.query(va) {
                space.map_page(alloc, va, pa, ov.protection, true)?;
            }
        }
    }

    space.install_self_map();
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    struct TestPhys {
        frames: Vec<&'static mut Frame>,
        next: usize,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Box::leak(Box::new(Frame([0; 4096]))));
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
    fn pae_map_and_query_round_trip() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(16);
        let space = PaeSpace::new(&mapper, &mut alloc, true).unwrap();

        space
            .map_page(
                &mut alloc,
                0x8180_0000,
                PhysAddr::new(0x40_0000),
                PageProtection {
                    write: true,
                    execute: true,
                },
                true,
            )
            .unwrap();

        assert_eq!(space.query(0x8180_0123), Some(PhysAddr::new(0x40_0123)));
        assert_eq!(space.query(0x8180_1000), None);
    }

    #[test]
    fn self_map_exposes_all_four_directories() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(16);
        let space = PaeSpace::new(&mapper, &mut alloc, false).unwrap();
        space.install_self_map();

        let pd3 = space.directories[3];
        for (i, pd) in space.directories.iter().enumerate() {
            let entry = space.table(pd3).entries[SELF_MAP_BASE_SLOT + i];
            assert!(entry.present());
            assert_eq!(entry.addr(), pd.as_u64());
        }
    }

    #[test]
    fn nx_bit_only_set_when_enabled() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(16);
        let space = PaeSpace::new(&mapper, &mut alloc, false).unwrap();
        let data = PageProtection {
            write: true,
            execute: false,
        };
        space
            .map_page(&mut alloc, 0x8000_0000, PhysAddr::new(0x10_0000), data, false)
            .unwrap();

        let pd = space.directories[2];
        let pde = space.table(pd).entries[0];
        let pte = space.table(PhysAddr::new(pde.addr())).entries[0];
        assert!(!pte.no_execute());
    }
}
