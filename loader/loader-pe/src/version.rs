//! Version-resource lookup. The kernel build number comes from the
//! `VS_FIXEDFILEINFO` of `ntoskrnl.exe`, so the walk only needs to find the
//! first `RT_VERSION` leaf.

use crate::PeError;
use crate::headers::{
    DIRECTORY_RESOURCE, FIXED_FILE_INFO_SIGNATURE, RESOURCE_TYPE_VERSION, ResourceDataEntry,
    ResourceDirectory, ResourceDirectoryEntry,
};
use crate::image::{PeImage, read_struct, read_u32};

const SUBDIRECTORY_FLAG: u32 = 0x8000_0000;

impl PeImage {
    /// `(FileVersionMS, FileVersionLS)` from the first version resource, or
    /// an error when the image carries none.
    pub(crate) fn read_version_resource(&self) -> Result<(u32, u32), PeError> {
        let dir = self
            .directory(DIRECTORY_RESOURCE)
            .ok_or(PeError::Malformed("no resource directory"))?;
        let root = dir.virtual_address as usize;

        let type_entry = self.find_resource_entry(root, Some(RESOURCE_TYPE_VERSION))?;
        let name_dir = root + (type_entry.offset & !SUBDIRECTORY_FLAG) as usize;
        let name_entry = self.find_resource_entry(name_dir, None)?;
        let lang_dir = root + (name_entry.offset & !SUBDIRECTORY_FLAG) as usize;
        let lang_entry = self.find_resource_entry(lang_dir, None)?;

        if lang_entry.offset & SUBDIRECTORY_FLAG != 0 {
            return Err(PeError::Malformed("version resource nests too deep"));
        }

        let data: ResourceDataEntry = read_struct(self.bytes(), root + lang_entry.offset as usize)?;
        let start = data.offset_to_data as usize;
        let len = data.size as usize;
        let blob = self
            .bytes()
            .get(start..start + len)
            .ok_or(PeError::Truncated)?;

        // The VS_VERSIONINFO header length varies with its UTF-16 key, so
        // locate the fixed info by its signature.
        for offset in (0..blob.len().saturating_sub(16)).step_by(4) {
            if read_u32(blob, offset)? == FIXED_FILE_INFO_SIGNATURE {
                let ms = read_u32(blob, offset + 8)?;
                let ls = read_u32(blob, offset + 12)?;
                return Ok((ms, ls));
            }
        }

        Err(PeError::Malformed("VS_FIXEDFILEINFO not found"))
    }

    fn find_resource_entry(
        &self,
        dir_offset: usize,
        id: Option<u32>,
    ) -> Result<ResourceDirectoryEntry, PeError> {
        let dir: ResourceDirectory = read_struct(self.bytes(), dir_offset)?;
        let named = dir.number_of_named_entries as usize;
        let total = named + dir.number_of_id_entries as usize;

        for i in 0..total {
            let entry = read_struct::<ResourceDirectoryEntry>(
                self.bytes(),
                dir_offset + size_of::<ResourceDirectory>()
                    + i * size_of::<ResourceDirectoryEntry>(),
            )?;

            match id {
                // First entry of any kind (name or language level).
                None => return Ok(entry),
                Some(want) if i >= named && entry.id == want => return Ok(entry),
                Some(_) => {}
            }
        }

        Err(PeError::Malformed("resource entry not found"))
    }
}
