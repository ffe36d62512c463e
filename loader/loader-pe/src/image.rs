//! The loaded-image handle: backing pages, header-derived scalars, and the
//! relocate/move lifecycle.

use crate::PeError;
use crate::headers::{
    CoffHeader, DIRECTORY_BASERELOC, DIRECTORY_LOAD_CONFIG, DOS_MAGIC, DataDirectory,
    DllCharacteristics, FileCharacteristics, MACHINE_AMD64, MACHINE_I386, MAGIC_PE32,
    MAGIC_PE32_PLUS, OptionalHeader32, OptionalHeader64, PE_SIGNATURE, PE_SIGNATURE_OFFSET,
    RELOC_ABSOLUTE, RELOC_DIR64, RELOC_HIGHLOW, RelocationBlock, SectionHeader,
};
use alloc::vec::Vec;
use bytemuck::pod_read_unaligned;
use loader_vmem::{PAGE_SIZE, PageAllocator, PhysAddr, page_count};
use log::{debug, warn};

/// Default `/GS` cookie values the compiler emits; a cookie slot holding one
/// of these has not been initialized yet.
const DEFAULT_COOKIE_32: u32 = 0xbb40_e64e;
const DEFAULT_COOKIE_64: u64 = 0x0000_2b99_2ddf_a232;

/// A PE image loaded into page-backed memory, laid out by virtual address.
pub struct PeImage {
    base: PhysAddr,
    pages: u64,
    owns_backing: bool,
    is_pe64: bool,
    machine: u16,
    preferred_base: u64,
    current_base: u64,
    size_of_image: u32,
    size_of_headers: u32,
    entry_point_rva: u32,
    checksum_offset: usize,
    characteristics: FileCharacteristics,
    dll_characteristics: DllCharacteristics,
    version_ms: u32,
    version_ls: u32,
    directories: Vec<DataDirectory>,
    sections: Vec<SectionHeader>,
    relocated: bool,
}

/// Copy a `#[repr(C)]` record out of the byte stream. File buffers carry no
/// alignment guarantee, so records are always read by value.
pub(crate) fn read_struct<T: bytemuck::AnyBitPattern>(
    bytes: &[u8],
    offset: usize,
) -> Result<T, PeError> {
    let end = offset
        .checked_add(size_of::<T>())
        .ok_or(PeError::Truncated)?;
    let slice = bytes.get(offset..end).ok_or(PeError::Truncated)?;
    Ok(pod_read_unaligned(slice))
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, PeError> {
    let slice = bytes.get(offset..offset + 2).ok_or(PeError::Truncated)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, PeError> {
    let slice = bytes.get(offset..offset + 4).ok_or(PeError::Truncated)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

impl PeImage {
    /// Load `file` into freshly allocated pages, laying sections out at their
    /// virtual offsets. When `intended_base` is given the image is relocated
    /// there immediately and the `/GS` cookie is seeded from `cookie_seed`.
    pub fn load(
        file: &[u8],
        intended_base: Option<u64>,
        alloc: &mut dyn PageAllocator,
        cookie_seed: u32,
    ) -> Result<Self, PeError> {
        if read_u16(file, 0)? != DOS_MAGIC {
            return Err(PeError::BadSignature);
        }

        let pe_offset = read_u32(file, PE_SIGNATURE_OFFSET)? as usize;
        if read_u32(file, pe_offset)? != PE_SIGNATURE {
            return Err(PeError::BadSignature);
        }

        let coff: CoffHeader = read_struct(file, pe_offset + 4)?;
        let machine = coff.machine;
        if machine != MACHINE_I386 && machine != MACHINE_AMD64 {
            return Err(PeError::UnsupportedMachine(machine));
        }

        let opt_offset = pe_offset + 4 + size_of::<CoffHeader>();
        let magic = read_u16(file, opt_offset)?;

        let (is_pe64, preferred_base, size_of_image, size_of_headers, entry, checksum_offset,
            dll_chars, dir_count, dirs_offset) = match magic {
            MAGIC_PE32 => {
                let opt: OptionalHeader32 = read_struct(file, opt_offset)?;
                (
                    false,
                    u64::from(opt.image_base),
                    opt.size_of_image,
                    opt.size_of_headers,
                    opt.address_of_entry_point,
                    opt_offset + 64,
                    opt.dll_characteristics,
                    opt.number_of_rva_and_sizes as usize,
                    opt_offset + size_of::<OptionalHeader32>(),
                )
            }
            MAGIC_PE32_PLUS => {
                let opt: OptionalHeader64 = read_struct(file, opt_offset)?;
                (
                    true,
                    opt.image_base,
                    opt.size_of_image,
                    opt.size_of_headers,
                    opt.address_of_entry_point,
                    opt_offset + 64,
                    opt.dll_characteristics,
                    opt.number_of_rva_and_sizes as usize,
                    opt_offset + size_of::<OptionalHeader64>(),
                )
            }
            _ => return Err(PeError::Malformed("unknown optional-header magic")),
        };

        let mut directories = Vec::with_capacity(dir_count.min(16));
        for i in 0..dir_count.min(16) {
            directories.push(read_struct::<DataDirectory>(file, dirs_offset + i * 8)?);
        }

        let sections_offset = opt_offset + coff.size_of_optional_header as usize;
        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        for i in 0..coff.number_of_sections as usize {
            sections.push(read_struct::<SectionHeader>(
                file,
                sections_offset + i * size_of::<SectionHeader>(),
            )?);
        }

        let pages = page_count(u64::from(size_of_image));
        let base = alloc.alloc_pages(pages).ok_or(PeError::OutOfMemory)?;

        // SAFETY: `base` is a fresh identity-mapped allocation of `pages`
        // pages, exclusively owned by this image from here on.
        let memory = unsafe {
            core::slice::from_raw_parts_mut(base.as_ptr(), (pages * PAGE_SIZE) as usize)
        };
        memory.fill(0);

        let header_len = (size_of_headers as usize).min(file.len());
        memory[..header_len].copy_from_slice(&file[..header_len]);

        for section in &sections {
            let raw_len = section.size_of_raw_data.min(section.virtual_size) as usize;
            if raw_len == 0 {
                continue;
            }

            let src_start = section.pointer_to_raw_data as usize;
            let src = file
                .get(src_start..src_start + raw_len)
                .ok_or(PeError::Truncated)?;
            let dst_start = section.virtual_address as usize;
            let dst = memory
                .get_mut(dst_start..dst_start + raw_len)
                .ok_or(PeError::Malformed("section outside SizeOfImage"))?;
            dst.copy_from_slice(src);
        }

        let mut image = Self {
            base,
            pages,
            owns_backing: true,
            is_pe64,
            machine,
            preferred_base,
            current_base: preferred_base,
            size_of_image,
            size_of_headers,
            entry_point_rva: entry,
            checksum_offset,
            characteristics: FileCharacteristics::from_bits_retain(coff.characteristics),
            dll_characteristics: DllCharacteristics::from_bits_retain(dll_chars),
            version_ms: 0,
            version_ls: 0,
            directories,
            sections,
            relocated: false,
        };

        let (ms, ls) = image.read_version_resource().unwrap_or((0, 0));
        image.version_ms = ms;
        image.version_ls = ls;

        image.seed_security_cookie(cookie_seed);

        if let Some(va) = intended_base {
            image.relocate(va)?;
        }

        Ok(image)
    }

    /// Image bytes, laid out by RVA.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the backing allocation stays alive and exclusively owned
        // until `free`/`move_to`.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size_of_image as usize) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`.
        unsafe {
            core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size_of_image as usize)
        }
    }

    /// Physical base of the backing pages.
    #[must_use]
    pub const fn address(&self) -> PhysAddr {
        self.base
    }

    /// The base address relocations currently assume.
    #[must_use]
    pub const fn current_base(&self) -> u64 {
        self.current_base
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size_of_image
    }

    #[must_use]
    pub const fn page_span(&self) -> u64 {
        self.pages
    }

    #[must_use]
    pub const fn is_pe64(&self) -> bool {
        self.is_pe64
    }

    #[must_use]
    pub const fn machine(&self) -> u16 {
        self.machine
    }

    /// Entry point at the image's current base.
    #[must_use]
    pub const fn entry_point(&self) -> u64 {
        self.current_base + self.entry_point_rva as u64
    }

    /// Header checksum field.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        read_u32(self.bytes(), self.checksum_offset).unwrap_or(0)
    }

    #[must_use]
    pub const fn characteristics(&self) -> FileCharacteristics {
        self.characteristics
    }

    #[must_use]
    pub const fn dll_characteristics(&self) -> DllCharacteristics {
        self.dll_characteristics
    }

    /// `(FileVersionMS, FileVersionLS)` from the version resource.
    #[must_use]
    pub const fn version(&self) -> (u32, u32) {
        (self.version_ms, self.version_ls)
    }

    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    pub(crate) fn directory(&self, index: usize) -> Option<DataDirectory> {
        self.directories
            .get(index)
            .copied()
            .filter(|d| d.virtual_address != 0 && d.size != 0)
    }

    /// Apply base relocations for `new_base`. Idempotent relative to the
    /// last call: the delta is always computed against the current base.
    pub fn relocate(&mut self, new_base: u64) -> Result<(), PeError> {
        let delta = new_base.wrapping_sub(self.current_base);
        if delta == 0 {
            self.relocated = true;
            return Ok(());
        }

        let Some(dir) = self.directory(DIRECTORY_BASERELOC) else {
            if self
                .characteristics
                .contains(FileCharacteristics::RELOCS_STRIPPED)
            {
                return Err(PeError::Malformed("relocations stripped"));
            }
            // Nothing to do; images without data fixups are legal.
            self.current_base = new_base;
            self.relocated = true;
            return Ok(());
        };

        let mut offset = dir.virtual_address as usize;
        let end = offset + dir.size as usize;

        while offset + size_of::<RelocationBlock>() <= end {
            let block = read_struct::<RelocationBlock>(self.bytes(), offset)?;
            if block.block_size < 8 {
                return Err(PeError::Malformed("relocation block underflow"));
            }

            let entries = (block.block_size as usize - size_of::<RelocationBlock>()) / 2;
            for i in 0..entries {
                let raw = read_u16(self.bytes(), offset + 8 + i * 2)?;
                let kind = raw >> 12;
                let target = block.page_rva as usize + (raw & 0xfff) as usize;

                match kind {
                    RELOC_ABSOLUTE => {}
                    RELOC_HIGHLOW => {
                        let value = read_u32(self.bytes(), target)?;
                        let fixed = value.wrapping_add(delta as u32);
                        self.bytes_mut()[target..target + 4]
                            .copy_from_slice(&fixed.to_le_bytes());
                    }
                    RELOC_DIR64 => {
                        let lo = read_u32(self.bytes(), target)?;
                        let hi = read_u32(self.bytes(), target + 4)?;
                        let value = u64::from(lo) | (u64::from(hi) << 32);
                        let fixed = value.wrapping_add(delta);
                        self.bytes_mut()[target..target + 8]
                            .copy_from_slice(&fixed.to_le_bytes());
                    }
                    other => {
                        warn!("unhandled relocation type {other}");
                        return Err(PeError::Malformed("unhandled relocation type"));
                    }
                }
            }

            offset += block.block_size as usize;
        }

        self.current_base = new_base;
        self.relocated = true;
        self.update_checksum();
        Ok(())
    }

    /// Copy the backing pages to `dest`. Ownership of the destination pages
    /// stays with the caller (the contiguous image region); the old backing
    /// is returned to the allocator.
    pub fn move_to(&mut self, dest: PhysAddr, alloc: &mut dyn PageAllocator) {
        if dest == self.base {
            return;
        }

        // SAFETY: both ranges are identity-mapped allocations of at least
        // `size_of_image` bytes and do not overlap (fresh region).
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr(),
                dest.as_ptr(),
                self.size_of_image as usize,
            );
        }

        if self.owns_backing {
            alloc.free_pages(self.base, self.pages);
        }
        self.base = dest;
        self.owns_backing = false;
        debug!("image moved to {dest}");
    }

    /// Release the backing pages.
    pub fn free(mut self, alloc: &mut dyn PageAllocator) {
        if self.owns_backing {
            alloc.free_pages(self.base, self.pages);
            self.owns_backing = false;
        }
    }

    /// Recompute the optional-header checksum over the in-memory image.
    ///
    /// The standard algorithm: ones-complement sum of 16-bit words with the
    /// checksum field itself counted as zero, plus the image length.
    pub fn update_checksum(&mut self) {
        let checksum_offset = self.checksum_offset;
        let len = self.size_of_image as usize;

        let mut sum: u64 = 0;
        let bytes = self.bytes();
        for (i, chunk) in bytes.chunks(2).enumerate() {
            let word_offset = i * 2;
            if word_offset == checksum_offset || word_offset == checksum_offset + 2 {
                continue;
            }
            let word = if chunk.len() == 2 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                u16::from(chunk[0])
            };
            sum += u64::from(word);
            sum = (sum & 0xffff) + (sum >> 16);
        }

        let mut checksum = ((sum & 0xffff) + (sum >> 16)) as u32;
        checksum += len as u32;

        self.bytes_mut()[checksum_offset..checksum_offset + 4]
            .copy_from_slice(&checksum.to_le_bytes());
    }

    /// Replace a compiler-default `/GS` cookie with a seeded value, the way
    /// the shipping loader primes `__security_cookie` before the kernel runs.
    fn seed_security_cookie(&mut self, seed: u32) {
        let Some(dir) = self.directory(DIRECTORY_LOAD_CONFIG) else {
            return;
        };

        // SecurityCookie pointer lives at +0x3c (PE32) / +0x58 (PE32+).
        let cookie_field = dir.virtual_address as usize + if self.is_pe64 { 0x58 } else { 0x3c };
        let mut state = if seed == 0 { 0x6261_6f74 } else { seed };
        let mut next = move || {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        if self.is_pe64 {
            let Ok(lo) = read_u32(self.bytes(), cookie_field) else {
                return;
            };
            let Ok(hi) = read_u32(self.bytes(), cookie_field + 4) else {
                return;
            };
            let cookie_va = u64::from(lo) | (u64::from(hi) << 32);
            if cookie_va == 0 {
                return;
            }
            let slot = (cookie_va - self.preferred_base) as usize;
            let Ok(lo) = read_u32(self.bytes(), slot) else {
                return;
            };
            let Ok(hi) = read_u32(self.bytes(), slot + 4) else {
                return;
            };
            let current = u64::from(lo) | (u64::from(hi) << 32);
            if current == DEFAULT_COOKIE_64 {
                let value =
                    ((u64::from(next()) << 32) | u64::from(next())) & 0x0000_ffff_ffff_ffff;
                self.bytes_mut()[slot..slot + 8].copy_from_slice(&value.to_le_bytes());
            }
        } else {
            let Ok(cookie_va) = read_u32(self.bytes(), cookie_field) else {
                return;
            };
            if cookie_va == 0 {
                return;
            }
            let slot = (u64::from(cookie_va) - self.preferred_base) as usize;
            let Ok(current) = read_u32(self.bytes(), slot) else {
                return;
            };
            if current == DEFAULT_COOKIE_32 {
                let value = next();
                self.bytes_mut()[slot..slot + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}
