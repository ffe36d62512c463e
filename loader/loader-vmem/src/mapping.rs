//! The address-space plan: an ordered set of physical→virtual mappings.
//!
//! Every allocation the kernel must be able to see is appended here together
//! with the memory-descriptor tag the kernel expects. The set enforces the
//! global invariant that no two mappings overlap in either address space,
//! and it answers the `find_virtual` queries the pointer-emission pass runs
//! on.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::{PAGE_SIZE, align_up};
use alloc::vec::Vec;

/// Memory-descriptor tags understood by the NT kernel.
///
/// The numeric values are part of the kernel ABI; they end up in the memory
/// descriptor list verbatim.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    ExceptionBlock = 1,
    SystemBlock = 2,
    Free = 3,
    Bad = 4,
    LoadedProgram = 5,
    FirmwareTemporary = 6,
    FirmwarePermanent = 7,
    OsloaderHeap = 8,
    OsloaderStack = 9,
    SystemCode = 10,
    HalCode = 11,
    BootDriver = 12,
    ConsoleInDriver = 13,
    ConsoleOutDriver = 14,
    StartupDpcStack = 15,
    StartupKernelStack = 16,
    StartupPanicStack = 17,
    StartupPcrPage = 18,
    StartupPdrPage = 19,
    RegistryData = 20,
    MemoryData = 21,
    NlsData = 22,
    SpecialMemory = 23,
    BbtMemory = 24,
    Reserve = 25,
}

impl MemoryKind {
    /// Whether the kernel may reclaim this range as general-purpose memory.
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free | Self::FirmwareTemporary)
    }

    /// Default page protection for ranges of this kind. Image mappings are
    /// refined per section through [`ProtectionOverride`]s afterwards.
    #[must_use]
    pub const fn default_protection(self) -> PageProtection {
        match self {
            Self::SystemCode | Self::HalCode | Self::BootDriver => PageProtection {
                write: true,
                execute: true,
            },
            _ => PageProtection {
                write: true,
                execute: false,
            },
        }
    }
}

/// Writability/executability derived from image section characteristics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageProtection {
    pub write: bool,
    pub execute: bool,
}

/// A page-granular refinement of an image mapping, one per PE section.
#[derive(Copy, Clone, Debug)]
pub struct ProtectionOverride {
    pub va: VirtAddr,
    pub pages: u64,
    pub protection: PageProtection,
}

/// One entry of the plan. `va == None` describes physical memory the kernel
/// must know about (free, firmware, bad) without a kernel-range mapping.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub va: Option<VirtAddr>,
    pub pa: PhysAddr,
    pub pages: u64,
    pub kind: MemoryKind,
}

impl Mapping {
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.pages * PAGE_SIZE
    }

    fn pa_end(&self) -> u64 {
        self.pa.as_u64() + self.byte_len()
    }

    fn va_range(&self) -> Option<(u64, u64)> {
        self.va.map(|va| (va.as_u64(), va.as_u64() + self.byte_len()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("virtual range {0}..+{1} pages overlaps an existing mapping")]
    VirtualOverlap(VirtAddr, u64),
    #[error("physical range {0}..+{1} pages overlaps an existing mapping of another kind")]
    PhysicalOverlap(PhysAddr, u64),
    #[error("mapping at {0} is not page aligned")]
    Unaligned(PhysAddr),
}

/// Ordered collection of [`Mapping`]s, the single source of truth for the
/// final address space.
#[derive(Default)]
pub struct MappingSet {
    entries: Vec<Mapping>,
    overrides: Vec<ProtectionOverride>,
}

impl MappingSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Append a mapping, merging with a physically and virtually adjacent
    /// mapping of the same kind when possible.
    pub fn add(
        &mut self,
        va: Option<VirtAddr>,
        pa: PhysAddr,
        pages: u64,
        kind: MemoryKind,
    ) -> Result<(), MappingError> {
        if pa.as_u64() % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned(pa));
        }
        if let Some(va) = va
            && va.as_u64() % PAGE_SIZE != 0
        {
            return Err(MappingError::Unaligned(PhysAddr(va.as_u64())));
        }

        let candidate = Mapping {
            va,
            pa,
            pages,
            kind,
        };

        for existing in &self.entries {
            if ranges_overlap(
                existing.pa.as_u64(),
                existing.pa_end(),
                pa.as_u64(),
                pa.as_u64() + pages * PAGE_SIZE,
            ) && existing.kind != kind
            {
                return Err(MappingError::PhysicalOverlap(pa, pages));
            }

            if let (Some((s0, s1)), Some((n0, n1))) = (existing.va_range(), candidate.va_range())
                && ranges_overlap(s0, s1, n0, n1)
            {
                return Err(MappingError::VirtualOverlap(candidate.va.unwrap_or_default(), pages));
            }
        }

        // Merge with an adjacent run of the same kind.
        for existing in &mut self.entries {
            if existing.kind != kind {
                continue;
            }

            let phys_adjacent = existing.pa_end() == pa.as_u64();
            let virt_adjacent = match (existing.va, va) {
                (Some(eva), Some(nva)) => eva.as_u64() + existing.byte_len() == nva.as_u64(),
                (None, None) => true,
                _ => false,
            };

            if phys_adjacent && virt_adjacent {
                existing.pages += pages;
                return Ok(());
            }
        }

        let insert_at = self
            .entries
            .partition_point(|m| m.pa.as_u64() <= pa.as_u64());
        self.entries.insert(insert_at, candidate);
        Ok(())
    }

    /// Record per-section protection for a sub-range of an image mapping.
    pub fn add_protection(&mut self, ov: ProtectionOverride) {
        self.overrides.push(ov);
    }

    /// Translate a physical address to its mapped virtual address.
    ///
    /// The address may point anywhere inside a mapping, not just at its
    /// base. Physical-only entries are skipped.
    #[must_use]
    pub fn find_virtual(&self, pa: PhysAddr) -> Option<VirtAddr> {
        for m in &self.entries {
            let Some(va) = m.va else { continue };
            if pa.as_u64() >= m.pa.as_u64() && pa.as_u64() < m.pa_end() {
                return Some(VirtAddr::new(va.as_u64() + (pa.as_u64() - m.pa.as_u64())));
            }
        }
        None
    }

    #[must_use]
    pub fn iter(&self) -> core::slice::Iter<'_, Mapping> {
        self.entries.iter()
    }

    #[must_use]
    pub fn overrides(&self) -> &[ProtectionOverride] {
        &self.overrides
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rebase a pointer that lives *inside* an object whose physical and virtual
/// bases are both known. Used for intra-store pointers where the whole object
/// moves as one unit.
#[must_use]
pub const fn fix_address(addr: u64, object_pa: PhysAddr, object_va: VirtAddr) -> VirtAddr {
    VirtAddr::new(object_va.as_u64() + (addr - object_pa.as_u64()))
}

const fn ranges_overlap(a0: u64, a1: u64, b0: u64, b1: u64) -> bool {
    a0 < b1 && b0 < a1
}

/// Monotonic virtual-address cursor for the kernel range.
///
/// Every kernel-visible allocation takes its virtual address from here, so
/// the layout is deterministic and gap-free modulo explicit padding.
#[derive(Debug)]
pub struct VaCursor {
    next: u64,
}

impl VaCursor {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { next: base }
    }

    /// Current position without consuming anything.
    #[must_use]
    pub const fn current(&self) -> VirtAddr {
        VirtAddr::new(self.next)
    }

    /// Consume `pages` pages and return their base.
    pub fn take(&mut self, pages: u64) -> VirtAddr {
        let va = VirtAddr::new(self.next);
        self.next += pages * PAGE_SIZE;
        va
    }

    /// Round the cursor up to `align` bytes (power of two).
    pub fn align_to(&mut self, align: u64) {
        self.next = align_up(self.next, align);
    }

    /// Move the cursor forward to an absolute address. Never moves backwards.
    pub fn advance_to(&mut self, va: VirtAddr) {
        if va.as_u64() > self.next {
            self.next = va.as_u64();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(x: u64) -> PhysAddr {
        PhysAddr::new(x)
    }

    fn va(x: u64) -> VirtAddr {
        VirtAddr::new(x)
    }

    #[test]
    fn find_virtual_hits_interior_addresses() {
        let mut set = MappingSet::new();
        set.add(Some(va(0xffff_f800_0000_0000)), pa(0x10_0000), 4, MemoryKind::SystemCode)
            .unwrap();

        assert_eq!(
            set.find_virtual(pa(0x10_0000)),
            Some(va(0xffff_f800_0000_0000))
        );
        assert_eq!(
            set.find_virtual(pa(0x10_2345)),
            Some(va(0xffff_f800_0000_2345))
        );
        assert_eq!(set.find_virtual(pa(0x10_4000)), None);
    }

    #[test]
    fn overlapping_virtual_ranges_are_rejected() {
        let mut set = MappingSet::new();
        set.add(Some(va(0x8000_0000)), pa(0x10_0000), 4, MemoryKind::SystemCode)
            .unwrap();

        let err = set
            .add(Some(va(0x8000_2000)), pa(0x20_0000), 4, MemoryKind::NlsData)
            .unwrap_err();
        assert!(matches!(err, MappingError::VirtualOverlap(..)));
    }

    #[test]
    fn overlapping_physical_ranges_of_other_kind_are_rejected() {
        let mut set = MappingSet::new();
        set.add(None, pa(0x10_0000), 16, MemoryKind::Free).unwrap();

        let err = set
            .add(Some(va(0x8000_0000)), pa(0x10_4000), 2, MemoryKind::SystemCode)
            .unwrap_err();
        assert!(matches!(err, MappingError::PhysicalOverlap(..)));
    }

    #[test]
    fn adjacent_same_kind_mappings_merge() {
        let mut set = MappingSet::new();
        set.add(Some(va(0x8000_0000)), pa(0x10_0000), 4, MemoryKind::NlsData)
            .unwrap();
        set.add(Some(va(0x8000_4000)), pa(0x10_4000), 2, MemoryKind::NlsData)
            .unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().pages, 6);
    }

    #[test]
    fn physical_only_entries_merge_but_do_not_resolve() {
        let mut set = MappingSet::new();
        set.add(None, pa(0x0), 16, MemoryKind::Free).unwrap();
        set.add(None, pa(0x1_0000), 16, MemoryKind::Free).unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.find_virtual(pa(0x800)), None);
    }

    #[test]
    fn cursor_is_monotonic_and_alignable() {
        let mut cur = VaCursor::new(0xffff_f800_0000_0000);
        let a = cur.take(3);
        assert_eq!(a.as_u64(), 0xffff_f800_0000_0000);
        cur.align_to(0x40_0000);
        let b = cur.take(1);
        assert_eq!(b.as_u64() % 0x40_0000, 0);
        assert!(b > a);
    }

    #[test]
    fn fix_address_rebases_into_the_object() {
        let object_pa = pa(0x7f00_0000);
        let object_va = va(0xffff_f800_1000_0000);
        let inner = fix_address(0x7f00_0123, object_pa, object_va);
        assert_eq!(inner.as_u64(), 0xffff_f800_1000_0123);
    }
}
