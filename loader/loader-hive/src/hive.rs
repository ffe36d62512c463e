//! Read-only `regf` walking: keys, subkey lists, values.

use crate::cells::{
    BaseBlock, HBIN_SIGNATURE, HIVE_DATA_OFFSET, KEY_COMP_NAME, KeyNode, LF_SIGNATURE,
    LH_SIGNATURE, LI_SIGNATURE, NK_SIGNATURE, REGF_SIGNATURE, RI_SIGNATURE, VALUE_COMP_NAME,
    VALUE_DATA_INLINE, VK_SIGNATURE, ValueRecord,
};
use crate::{HiveError, REG_BINARY, REG_DWORD, REG_EXPAND_SZ, REG_MULTI_SZ, REG_QWORD, REG_SZ};
use alloc::string::String;
use alloc::vec::Vec;
use bytemuck::pod_read_unaligned;
use log::warn;

/// Opaque reference to a key node (a cell offset).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyHandle(u32);

/// A decoded registry value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    Dword(u32),
    Qword(u64),
    String(String),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
    Other(u32, Vec<u8>),
}

impl Value {
    #[must_use]
    pub const fn as_dword(&self) -> Option<u32> {
        match self {
            Self::Dword(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// An opened hive. Owns the file bytes until [`Hive::steal_data`].
pub struct Hive {
    data: Vec<u8>,
}

fn read_struct<T: bytemuck::AnyBitPattern>(
    bytes: &[u8],
    offset: usize,
) -> Result<T, HiveError> {
    let end = offset
        .checked_add(size_of::<T>())
        .ok_or(HiveError::Truncated)?;
    let slice = bytes.get(offset..end).ok_or(HiveError::Truncated)?;
    Ok(pod_read_unaligned(slice))
}

/// Decode a key or value name: Latin-1 when the record is flagged
/// compressed, UTF-16LE otherwise.
fn decode_name(bytes: &[u8], compressed: bool) -> String {
    if compressed {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        char::decode_utf16(units.into_iter())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

fn decode_utf16(bytes: &[u8]) -> String {
    decode_name(bytes, false)
}

/// Split a UTF-16LE `REG_MULTI_SZ` blob into its strings.
fn decode_multi_sz(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for chunk in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
        if unit == 0 {
            if current.is_empty() {
                break;
            }
            out.push(
                char::decode_utf16(current.drain(..))
                    .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
            );
        } else {
            current.push(unit);
        }
    }
    if !current.is_empty() {
        out.push(
            char::decode_utf16(current.drain(..))
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        );
    }
    out
}

impl Hive {
    /// Validate the base block and take ownership of the bytes.
    pub fn open(data: Vec<u8>) -> Result<Self, HiveError> {
        let base: BaseBlock = read_struct(&data, 0)?;
        if base.signature != REGF_SIGNATURE {
            return Err(HiveError::BadSignature);
        }

        let mut checksum = 0u32;
        for i in 0..127 {
            checksum ^= read_struct::<u32>(&data, i * 4)?;
        }
        let stored: u32 = read_struct(&data, 508)?;
        if checksum != stored {
            return Err(HiveError::BadChecksum);
        }

        // The first bin must directly follow the base block.
        let first_bin: u32 = read_struct(&data, HIVE_DATA_OFFSET)?;
        if first_bin != HBIN_SIGNATURE {
            return Err(HiveError::Malformed("first hbin missing"));
        }

        Ok(Self { data })
    }

    /// Detach the raw bytes; they stay valid for the kernel to re-read.
    #[must_use]
    pub fn steal_data(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Payload of the cell at hive-relative `offset`.
    fn cell(&self, offset: u32) -> Result<&[u8], HiveError> {
        let start = HIVE_DATA_OFFSET + offset as usize;
        let size: i32 = read_struct(&self.data, start)?;
        // Negative size marks an allocated cell.
        if size >= 0 {
            return Err(HiveError::Malformed("reference into a free cell"));
        }
        let len = size.unsigned_abs() as usize;
        self.data
            .get(start + 4..start + len)
            .ok_or(HiveError::Truncated)
    }

    fn key_node(&self, handle: KeyHandle) -> Result<(KeyNode, &[u8]), HiveError> {
        let cell = self.cell(handle.0)?;
        let node: KeyNode = read_struct(cell, 0)?;
        if node.signature != NK_SIGNATURE {
            return Err(HiveError::Malformed("expected nk record"));
        }
        Ok((node, cell))
    }

    /// The root key.
    pub fn root(&self) -> Result<KeyHandle, HiveError> {
        let base: BaseBlock = read_struct(&self.data, 0)?;
        let handle = KeyHandle(base.root_cell);
        self.key_node(handle)?;
        Ok(handle)
    }

    /// Name of the key itself.
    pub fn key_name(&self, key: KeyHandle) -> Result<String, HiveError> {
        let (node, cell) = self.key_node(key)?;
        let name = cell
            .get(size_of::<KeyNode>()..size_of::<KeyNode>() + node.name_len as usize)
            .ok_or(HiveError::Truncated)?;
        Ok(decode_name(name, node.flags & KEY_COMP_NAME != 0))
    }

    /// Collect subkey cell offsets, flattening `ri` indirection.
    fn subkey_offsets(&self, list_cell: u32, out: &mut Vec<u32>) -> Result<(), HiveError> {
        let cell = self.cell(list_cell)?;
        let signature: u16 = read_struct(cell, 0)?;
        let count: u16 = read_struct(cell, 2)?;

        match signature {
            LF_SIGNATURE | LH_SIGNATURE => {
                for i in 0..count as usize {
                    out.push(read_struct::<u32>(cell, 4 + i * 8)?);
                }
            }
            LI_SIGNATURE => {
                for i in 0..count as usize {
                    out.push(read_struct::<u32>(cell, 4 + i * 4)?);
                }
            }
            RI_SIGNATURE => {
                for i in 0..count as usize {
                    let sub = read_struct::<u32>(cell, 4 + i * 4)?;
                    self.subkey_offsets(sub, out)?;
                }
            }
            _ => return Err(HiveError::Malformed("unknown subkey list")),
        }
        Ok(())
    }

    /// Find a direct child by name (ASCII case-insensitive).
    fn find_child(&self, parent: KeyHandle, name: &str) -> Result<KeyHandle, HiveError> {
        let (node, _) = self.key_node(parent)?;
        if node.subkey_count == 0 {
            return Err(HiveError::KeyNotFound);
        }

        let mut offsets = Vec::with_capacity(node.subkey_count as usize);
        self.subkey_offsets(node.subkey_list, &mut offsets)?;

        for offset in offsets {
            let candidate = KeyHandle(offset);
            if self.key_name(candidate)?.eq_ignore_ascii_case(name) {
                return Ok(candidate);
            }
        }
        Err(HiveError::KeyNotFound)
    }

    /// Walk a backslash-separated path below `parent`.
    pub fn find_key(&self, parent: KeyHandle, path: &str) -> Result<KeyHandle, HiveError> {
        let mut current = parent;
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            current = self.find_child(current, component)?;
        }
        Ok(current)
    }

    /// Name of the `index`-th subkey, or `None` past the end.
    pub fn enum_keys(&self, key: KeyHandle, index: usize) -> Result<Option<String>, HiveError> {
        let (node, _) = self.key_node(key)?;
        if index >= node.subkey_count as usize {
            return Ok(None);
        }

        let mut offsets = Vec::with_capacity(node.subkey_count as usize);
        self.subkey_offsets(node.subkey_list, &mut offsets)?;
        match offsets.get(index) {
            Some(&offset) => Ok(Some(self.key_name(KeyHandle(offset))?)),
            None => Ok(None),
        }
    }

    fn value_data(&self, record: &ValueRecord) -> Result<Vec<u8>, HiveError> {
        let len = (record.data_size & !VALUE_DATA_INLINE) as usize;
        if record.data_size & VALUE_DATA_INLINE != 0 {
            // Small data lives in the offset field itself.
            let bytes = record.data_offset.to_le_bytes();
            return Ok(bytes.get(..len.min(4)).unwrap_or(&bytes).to_vec());
        }
        let data_cell = self.cell(record.data_offset)?;
        data_cell
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or(HiveError::Truncated)
    }

    /// Look up a value by name (ASCII case-insensitive) and decode it.
    pub fn query_value(&self, key: KeyHandle, name: &str) -> Result<Option<Value>, HiveError> {
        let (node, _) = self.key_node(key)?;
        if node.value_count == 0 {
            return Ok(None);
        }

        let list = self.cell(node.value_list)?;
        for i in 0..node.value_count as usize {
            let value_cell_offset: u32 = read_struct(list, i * 4)?;
            let cell = self.cell(value_cell_offset)?;
            let record: ValueRecord = read_struct(cell, 0)?;
            if record.signature != VK_SIGNATURE {
                return Err(HiveError::Malformed("expected vk record"));
            }

            let value_name = if record.name_len == 0 {
                String::new()
            } else {
                let raw = cell
                    .get(size_of::<ValueRecord>()
                        ..size_of::<ValueRecord>() + record.name_len as usize)
                    .ok_or(HiveError::Truncated)?;
                decode_name(raw, record.flags & VALUE_COMP_NAME != 0)
            };

            if !value_name.eq_ignore_ascii_case(name) {
                continue;
            }

            let data = self.value_data(&record)?;
            return Ok(Some(Self::decode_value(name, record.data_type, data)));
        }

        Ok(None)
    }

    fn decode_value(name: &str, data_type: u32, data: Vec<u8>) -> Value {
        match data_type {
            REG_DWORD if data.len() >= 4 => {
                Value::Dword(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
            }
            REG_QWORD if data.len() >= 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data[..8]);
                Value::Qword(u64::from_le_bytes(b))
            }
            REG_SZ | REG_EXPAND_SZ => {
                let trimmed = data.strip_suffix(&[0, 0]).unwrap_or(&data);
                Value::String(decode_utf16(trimmed))
            }
            REG_MULTI_SZ => Value::MultiString(decode_multi_sz(&data)),
            REG_BINARY => Value::Binary(data),
            other => {
                warn!("value {name} has unusual type {other}");
                Value::Other(other, data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhive::{TestKey, TestValue, build_hive};

    fn sample() -> Hive {
        let root = TestKey::new("ROOT")
            .child(
                TestKey::new("Select").value("Default", TestValue::Dword(1)),
            )
            .child(
                TestKey::new("ControlSet001").child(
                    TestKey::new("Control")
                        .value("SystemStartOptions", TestValue::Sz(String::from("NOEXECUTE")))
                        .child(
                            TestKey::new("Nls").child(
                                TestKey::new("CodePage")
                                    .value("ACP", TestValue::Sz(String::from("1252")))
                                    .value("1252", TestValue::Sz(String::from("c_1252.nls"))),
                            ),
                        ),
                ),
            );
        Hive::open(build_hive(&root)).unwrap()
    }

    #[test]
    fn open_rejects_garbage() {
        assert!(matches!(
            Hive::open(alloc::vec![0u8; 0x2000]),
            Err(HiveError::BadSignature)
        ));
    }

    #[test]
    fn open_rejects_corrupted_checksum() {
        let root = TestKey::new("ROOT");
        let mut file = build_hive(&root);
        file[16] ^= 0xff; // inside the checksummed region
        assert!(matches!(Hive::open(file), Err(HiveError::BadChecksum)));
    }

    #[test]
    fn find_key_walks_paths_case_insensitively() {
        let hive = sample();
        let root = hive.root().unwrap();

        let key = hive
            .find_key(root, "controlset001\\CONTROL\\Nls\\CodePage")
            .unwrap();
        assert_eq!(hive.key_name(key).unwrap(), "CodePage");

        assert!(matches!(
            hive.find_key(root, "ControlSet001\\Missing"),
            Err(HiveError::KeyNotFound)
        ));
    }

    #[test]
    fn enum_keys_reports_children_then_none() {
        let hive = sample();
        let root = hive.root().unwrap();

        assert_eq!(hive.enum_keys(root, 0).unwrap().as_deref(), Some("Select"));
        assert_eq!(
            hive.enum_keys(root, 1).unwrap().as_deref(),
            Some("ControlSet001")
        );
        assert_eq!(hive.enum_keys(root, 2).unwrap(), None);
    }

    #[test]
    fn query_value_decodes_types() {
        let hive = sample();
        let root = hive.root().unwrap();

        let select = hive.find_key(root, "Select").unwrap();
        assert_eq!(
            hive.query_value(select, "default").unwrap(),
            Some(Value::Dword(1))
        );

        let control = hive.find_key(root, "ControlSet001\\Control").unwrap();
        assert_eq!(
            hive.query_value(control, "SystemStartOptions").unwrap(),
            Some(Value::String(String::from("NOEXECUTE")))
        );
        assert_eq!(hive.query_value(control, "NotThere").unwrap(), None);
    }

    #[test]
    fn steal_data_returns_the_original_bytes() {
        let root = TestKey::new("ROOT");
        let file = build_hive(&root);
        let hive = Hive::open(file.clone()).unwrap();
        assert_eq!(hive.steal_data(), file);
    }
}
