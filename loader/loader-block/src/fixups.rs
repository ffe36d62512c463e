//! Deferred pointer materialization.
//!
//! While the store and its satellites are assembled, every pointer-sized
//! slot that holds a *physical* pointer is registered here. Nothing walks
//! the finished structures afterwards: one [`FixupTable::emit`] pass reads
//! each registered slot, translates the value through the mapping set, and
//! writes the virtual address back. A slot whose value has no mapping is an
//! error — it would hand the kernel a pointer into the identity map.

use alloc::collections::BTreeSet;
use loader_vmem::{MappingSet, PhysAddr};
use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("slot {slot:#x} holds {value:#x}, which no mapping covers")]
    Unmapped { slot: u64, value: u64 },
}

/// The set of pointer slots to rewrite, by physical address.
#[derive(Default)]
pub struct FixupTable {
    slots: BTreeSet<u64>,
}

impl FixupTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: BTreeSet::new(),
        }
    }

    /// Register a pointer-sized slot. Registration is idempotent; list
    /// splicing touches the same slot repeatedly.
    pub fn register(&mut self, slot: PhysAddr) {
        self.slots.insert(slot.as_u64());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Rewrite every registered slot from physical to virtual. Null slots
    /// are left alone (optional fields that were never populated).
    ///
    /// Returns the number of slots rewritten.
    ///
    /// # Safety
    /// Every registered slot must still be identity-mapped writable memory.
    pub unsafe fn emit(&self, mappings: &MappingSet) -> Result<usize, EmitError> {
        let mut rewritten = 0;

        for &slot in &self.slots {
            // SAFETY: slots were registered while writing through these
            // exact addresses; the allocations stay alive until handoff.
            let value = unsafe { core::ptr::read_unaligned(slot as *const usize) };
            if value == 0 {
                continue;
            }

            let va = mappings
                .find_virtual(PhysAddr::new(value as u64))
                .ok_or(EmitError::Unmapped {
                    slot,
                    value: value as u64,
                })?;

            unsafe {
                core::ptr::write_unaligned(slot as *mut usize, va.as_u64() as usize);
            }
            rewritten += 1;
        }

        debug!("rewrote {rewritten} pointer slots to virtual addresses");
        Ok(rewritten)
    }
}
