//! Two-level non-PAE tables for x86 kernels without large-address-aware
//! headers. 4-byte entries, no NX, 4 MiB large pages.

use crate::addresses::PhysAddr;
use crate::mapping::{MappingSet, PageProtection};
use crate::{FrameAlloc, PAGE_SIZE, PhysMapper};
use bitfield_struct::bitfield;

/// Directory slot of the classic 0xC0000000 self-map.
pub const SELF_MAP_SLOT: usize = 0x300;

/// A 4-byte legacy entry (PDE or PTE).
#[bitfield(u32)]
pub struct LegacyEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large: bool,
    pub global: bool,
    #[bits(3)]
    pub avail: u8,
    #[bits(20)]
    pub frame: u32,
}

impl LegacyEntry {
    #[must_use]
    pub const fn addr(self) -> u32 {
        self.frame() << 12
    }
}

/// A 4 KiB frame of 1024 four-byte entries.
#[repr(C, align(4096))]
pub struct LegacyTable {
    pub entries: [LegacyEntry; 1024],
}

#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("out of frames while building legacy tables")]
    OutOfFrames,
    #[error("attempted to map unaligned address {0:#x}")]
    Unaligned(u32),
}

pub struct LegacySpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

const fn pd_index(va: u32) -> usize {
    (va >> 22) as usize
}

const fn pt_index(va: u32) -> usize {
    ((va >> 12) & 0x3ff) as usize
}

impl<'m, M: PhysMapper> LegacySpace<'m, M> {
    pub fn new(mapper: &'m M, alloc: &mut impl FrameAlloc) -> Result<Self, LegacyError> {
        let root = alloc.alloc_frame().ok_or(LegacyError::OutOfFrames)?;
        Ok(Self { root, mapper })
    }

    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    fn table(&self, pa: PhysAddr) -> &mut LegacyTable {
        unsafe { self.mapper.phys_to_mut::<LegacyTable>(pa) }
    }

    pub fn map_page(
        &self,
        alloc: &mut impl FrameAlloc,
        va: u32,
        pa: PhysAddr,
        protection: PageProtection,
        global: bool,
    ) -> Result<(), LegacyError> {
        if u64::from(va) % PAGE_SIZE != 0 || pa.as_u64() % PAGE_SIZE != 0 {
            return Err(LegacyError::Unaligned(va));
        }

        let pde = self.table(self.root).entries[pd_index(va)];
        let pt = if pde.present() {
            PhysAddr::new(pde.addr().into())
        } else {
            let pt = alloc.alloc_frame().ok_or(LegacyError::OutOfFrames)?;
            self.table(self.root).entries[pd_index(va)] = LegacyEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_frame((pt.as_u64() >> 12) as u32);
            pt
        };

        self.table(pt).entries[pt_index(va)] = LegacyEntry::new()
            .with_present(true)
            .with_writable(protection.write)
            .with_global(global)
            .with_frame((pa.as_u64() >> 12) as u32);
        Ok(())
    }

    /// Identity-map a physical range with 4 MiB leaves where aligned.
    pub fn identity_map(
        &self,
        alloc: &mut impl FrameAlloc,
        base: PhysAddr,
        pages: u64,
    ) -> Result<(), LegacyError> {
        let prot = PageProtection {
            write: true,
            execute: true,
        };
        let mut addr = base.as_u64();
        let end = base.as_u64() + pages * PAGE_SIZE;
        while addr < end {
            if addr % 0x40_0000 == 0 && end - addr >= 0x40_0000 {
                self.table(self.root).entries[pd_index(addr as u32)] = LegacyEntry::new()
                    .with_present(true)
                    .with_writable(true)
                    .with_large(true)
                    .with_frame((addr >> 12) as u32);
                addr += 0x40_0000;
            } else {
                self.map_page(alloc, addr as u32, PhysAddr::new(addr), prot, false)?;
                addr += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Point the classic recursive slot back at the directory.
    pub fn install_self_map(&self) {
        self.table(self.root).entries[SELF_MAP_SLOT] = LegacyEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_frame((self.root.as_u64() >> 12) as u32);
    }

    #[must_use]
    pub fn query(&self, va: u32) -> Option<PhysAddr> {
        let pde = self.table(self.root).entries[pd_index(va)];
        if !pde.present() {
            return None;
        }
        if pde.large() {
            return Some(PhysAddr::new(u64::from(pde.addr()) + u64::from(va & 0x3f_ffff)));
        }
        let pte = self.table(PhysAddr::new(pde.addr().into())).entries[pt_index(va)];
        if !pte.present() {
            return None;
        }
        Some(PhysAddr::new(u64::from(pte.addr()) + u64::from(va & 0xfff)))
    }
}

/// Legacy counterpart of [`crate::long_mode::materialize`].
pub fn materialize<'m, M: PhysMapper>(
    mapper: &'m M,
    alloc: &mut impl FrameAlloc,
    mappings: &MappingSet,
    identity: &[(PhysAddr, u64)],
) -> Result<LegacySpace<'m, M>, LegacyError> {
    let space = LegacySpace::new(mapper, alloc)?;

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
    fn legacy_map_and_query_round_trip() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(8);
        let space = LegacySpace::new(&mapper, &mut alloc).unwrap();

        space
            .map_page(
                &mut alloc,
                0x8000_1000,
                PhysAddr::new(0x20_0000),
                PageProtection {
                    write: true,
                    execute: true,
                },
                true,
            )
            .unwrap();

        assert_eq!(space.query(0x8000_1abc), Some(PhysAddr::new(0x20_0abc)));
        assert_eq!(space.query(0x8000_2000), None);
    }

    #[test]
    fn legacy_self_map_points_at_directory() {
        let mapper = IdentityMapper;
        let mut alloc = TestPhys::with_frames(8);
        let space = LegacySpace::new(&mapper, &mut alloc).unwrap();
        space.install_self_map();

        let entry = space.table(space.root()).entries[SELF_MAP_SLOT];
        assert!(entry.present());
        assert_eq!(u64::from(entry.addr()), space.root().as_u64());
    }
}
