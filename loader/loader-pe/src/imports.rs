//! Import enumeration, IAT resolution, and export lookup with forwarder
//! chains.

use crate::PeError;
use crate::headers::{
    DIRECTORY_EXPORT, DIRECTORY_IMPORT, ExportDirectory, ImportDescriptor, ORDINAL_FLAG_32,
    ORDINAL_FLAG_64,
};
use crate::image::{PeImage, read_struct, read_u16, read_u32};
use alloc::string::String;
use alloc::vec::Vec;
use log::warn;

/// Resolver invoked for forwarded exports. Receives `"dll.function"` and
/// returns the final virtual address.
pub type ForwardResolver<'a> = &'a mut dyn FnMut(&str) -> Option<u64>;

fn read_cstr(bytes: &[u8], offset: usize) -> Result<&str, PeError> {
    let tail = bytes.get(offset..).ok_or(PeError::Truncated)?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(PeError::Truncated)?;
    core::str::from_utf8(&tail[..end]).map_err(|_| PeError::Malformed("non-ASCII name"))
}

impl PeImage {
    /// Names of every DLL this image imports, in descriptor order.
    pub fn list_imports(&self) -> Result<Vec<String>, PeError> {
        let mut names = Vec::new();
        let Some(dir) = self.directory(DIRECTORY_IMPORT) else {
            return Ok(names);
        };

        let mut offset = dir.virtual_address as usize;
        loop {
            let descriptor = read_struct::<ImportDescriptor>(self.bytes(), offset)?;
            if descriptor.is_terminator() {
                break;
            }

            names.push(String::from(read_cstr(
                self.bytes(),
                descriptor.name as usize,
            )?));
            offset += size_of::<ImportDescriptor>();
        }

        Ok(names)
    }

    fn import_descriptor(&self, library: &str) -> Result<Option<ImportDescriptor>, PeError> {
        let Some(dir) = self.directory(DIRECTORY_IMPORT) else {
            return Ok(None);
        };

        let mut offset = dir.virtual_address as usize;
        loop {
            let descriptor = read_struct::<ImportDescriptor>(self.bytes(), offset)?;
            if descriptor.is_terminator() {
                return Ok(None);
            }

            let name = read_cstr(self.bytes(), descriptor.name as usize)?;
            if name.eq_ignore_ascii_case(library) {
                return Ok(Some(descriptor));
            }
            offset += size_of::<ImportDescriptor>();
        }
    }

    /// Resolve every IAT slot of the descriptor for `library_name` against
    /// the exports of `library`, following forwarders through `resolve`.
    pub fn resolve_imports(
        &mut self,
        library_name: &str,
        library: &PeImage,
        resolve: ForwardResolver<'_>,
    ) -> Result<(), PeError> {
        let Some(descriptor) = self.import_descriptor(library_name)? else {
            return Ok(());
        };

        // The lookup table keeps the original name/ordinal entries; the IAT
        // at FirstThunk receives the resolved addresses.
        let lookup_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        } as usize;
        let iat_rva = descriptor.first_thunk as usize;
        let thunk_size = if self.is_pe64() { 8 } else { 4 };

        let mut index = 0;
        loop {
            let lookup_offset = lookup_rva + index * thunk_size;
            let entry = if self.is_pe64() {
                let lo = read_u32(self.bytes(), lookup_offset)?;
                let hi = read_u32(self.bytes(), lookup_offset + 4)?;
                u64::from(lo) | (u64::from(hi) << 32)
            } else {
                u64::from(read_u32(self.bytes(), lookup_offset)?)
            };

            if entry == 0 {
                break;
            }

            let by_ordinal = if self.is_pe64() {
                entry & ORDINAL_FLAG_64 != 0
            } else {
                entry as u32 & ORDINAL_FLAG_32 != 0
            };

            let address = if by_ordinal {
                library.find_export_by_ordinal((entry & 0xffff) as u16, &mut *resolve)?
            } else {
                // Skip the two-byte hint before the name. The name lives in
                // our own image; the export walk happens in `library`.
                let owned = String::from(read_cstr(self.bytes(), entry as usize + 2)?);
                library.find_export(&owned, &mut *resolve)?
            };

            let slot = iat_rva + index * thunk_size;
            if self.is_pe64() {
                self.bytes_mut()[slot..slot + 8].copy_from_slice(&address.to_le_bytes());
            } else {
                self.bytes_mut()[slot..slot + 4]
                    .copy_from_slice(&(address as u32).to_le_bytes());
            }

            index += 1;
        }

        Ok(())
    }

    fn export_rva_to_address(
        &self,
        rva: u32,
        dir_start: u32,
        dir_size: u32,
        resolve: ForwardResolver<'_>,
    ) -> Result<u64, PeError> {
        if rva >= dir_start && rva < dir_start + dir_size {
            // Forwarder: the "address" is a `dll.function` string inside the
            // export directory.
            let target = read_cstr(self.bytes(), rva as usize)?;
            let owned = String::from(target);
            return resolve(&owned).ok_or(PeError::ForwarderUnresolved);
        }
        Ok(self.current_base() + u64::from(rva))
    }

    /// Look up an export by name, following forwarder chains.
    pub fn find_export(&self, name: &str, resolve: ForwardResolver<'_>) -> Result<u64, PeError> {
        let dir = self
            .directory(DIRECTORY_EXPORT)
            .ok_or(PeError::ExportNotFound)?;
        let export: ExportDirectory = read_struct(self.bytes(), dir.virtual_address as usize)?;

        let names = export.address_of_names as usize;
        let ordinals = export.address_of_name_ordinals as usize;
        let functions = export.address_of_functions as usize;

        for i in 0..export.number_of_names as usize {
            let name_rva = read_u32(self.bytes(), names + i * 4)?;
            let candidate = read_cstr(self.bytes(), name_rva as usize)?;
            if candidate != name {
                continue;
            }

            let ordinal = read_u16(self.bytes(), ordinals + i * 2)? as usize;
            if ordinal >= export.number_of_functions as usize {
                return Err(PeError::Malformed("export ordinal out of range"));
            }

            let rva = read_u32(self.bytes(), functions + ordinal * 4)?;
            return self.export_rva_to_address(rva, dir.virtual_address, dir.size, resolve);
        }

        warn!("export {name} not found");
        Err(PeError::ExportNotFound)
    }

    /// Look up an export by (biased) ordinal.
    pub fn find_export_by_ordinal(
        &self,
        ordinal: u16,
        resolve: ForwardResolver<'_>,
    ) -> Result<u64, PeError> {
        let dir = self
            .directory(DIRECTORY_EXPORT)
            .ok_or(PeError::ExportNotFound)?;
        let export: ExportDirectory = read_struct(self.bytes(), dir.virtual_address as usize)?;

        let index = u32::from(ordinal)
            .checked_sub(export.base)
            .ok_or(PeError::ExportNotFound)? as usize;
        if index >= export.number_of_functions as usize {
            return Err(PeError::ExportNotFound);
        }

        let rva = read_u32(self.bytes(), export.address_of_functions as usize + index * 4)?;
        self.export_rva_to_address(rva, dir.virtual_address, dir.size, resolve)
    }
}
