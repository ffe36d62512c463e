//! Page-table entry and table frame types shared by the 64-bit and PAE
//! formats (both use 8-byte entries with the same low-bit layout).

use bitfield_struct::bitfield;

/// An 8-byte page-table entry (PML4E/PDPTE/PDE/PTE).
#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// `PS` on PDE/PDPTE (large page); PAT bit on a PTE.
    pub large: bool,
    pub global: bool,
    #[bits(3)]
    pub avail: u8,
    /// Physical frame number (bits 12..51 of the address).
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    pub avail_high: u16,
    pub no_execute: bool,
}

impl PageEntry {
    /// Physical address this entry points at.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.frame() << 12
    }

    /// Entry pointing at `addr` (page-aligned) with the given access bits.
    #[must_use]
    pub fn leaf(addr: u64, writable: bool, no_execute: bool, global: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_no_execute(no_execute)
            .with_global(global)
            .with_frame(addr >> 12)
    }

    /// Non-leaf entry linking to the next-level table at `addr`.
    #[must_use]
    pub fn table(addr: u64) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(addr >> 12)
    }
}

/// A 4 KiB table frame of 512 eight-byte entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; 512],
}

impl PageTable {
    pub fn zero(&mut self) {
        for e in &mut self.entries {
            *e = PageEntry::new();
        }
    }
}
