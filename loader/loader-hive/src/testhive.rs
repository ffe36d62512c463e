//! Test-only builder producing valid `regf` bytes from a key tree.

use crate::cells::{
    HIVE_DATA_OFFSET, KEY_COMP_NAME, KEY_HIVE_ENTRY, VALUE_COMP_NAME, VALUE_DATA_INLINE,
};
use crate::{REG_BINARY, REG_DWORD, REG_MULTI_SZ, REG_SZ};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

pub enum TestValue {
    Dword(u32),
    Sz(String),
    MultiSz(Vec<String>),
    Binary(Vec<u8>),
}

pub struct TestKey {
    pub name: String,
    pub values: Vec<(String, TestValue)>,
    pub children: Vec<TestKey>,
}

impl TestKey {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn value(mut self, name: &str, value: TestValue) -> Self {
        self.values.push((String::from(name), value));
        self
    }

    pub fn child(mut self, child: TestKey) -> Self {
        self.children.push(child);
        self
    }
}

/// Cells area builder; offsets are hive-relative (0 = first byte after the
/// base block).
struct Cells {
    data: Vec<u8>,
}

impl Cells {
    fn new() -> Self {
        // Space for the hbin header, filled in at the end.
        Self {
            data: vec![0; 0x20],
        }
    }

    fn alloc(&mut self, payload: &[u8]) -> u32 {
        let offset = self.data.len() as u32;
        let size = ((payload.len() + 4 + 7) & !7) as i32;
        self.data.extend_from_slice(&(-size).to_le_bytes());
        self.data.extend_from_slice(payload);
        self.data.resize(offset as usize + size as usize, 0);
        offset
    }
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn serialize_value(cells: &mut Cells, name: &str, value: &TestValue) -> u32 {
    let (data_type, data): (u32, Vec<u8>) = match value {
        TestValue::Dword(v) => (REG_DWORD, v.to_le_bytes().to_vec()),
        TestValue::Sz(s) => {
            let mut bytes = utf16_bytes(s);
            bytes.extend_from_slice(&[0, 0]);
            (REG_SZ, bytes)
        }
        TestValue::MultiSz(strings) => {
            let mut bytes = Vec::new();
            for s in strings {
                bytes.extend(utf16_bytes(s));
                bytes.extend_from_slice(&[0, 0]);
            }
            bytes.extend_from_slice(&[0, 0]);
            (REG_MULTI_SZ, bytes)
        }
        TestValue::Binary(b) => (REG_BINARY, b.clone()),
    };

    let (data_size, data_offset) = if data.len() <= 4 {
        let mut inline = [0u8; 4];
        inline[..data.len()].copy_from_slice(&data);
        (
            data.len() as u32 | VALUE_DATA_INLINE,
            u32::from_le_bytes(inline),
        )
    } else {
        (data.len() as u32, cells.alloc(&data))
    };

    let mut vk = Vec::new();
    vk.extend_from_slice(b"vk");
    vk.extend_from_slice(&(name.len() as u16).to_le_bytes());
    vk.extend_from_slice(&data_size.to_le_bytes());
    vk.extend_from_slice(&data_offset.to_le_bytes());
    vk.extend_from_slice(&data_type.to_le_bytes());
    vk.extend_from_slice(&VALUE_COMP_NAME.to_le_bytes());
    vk.extend_from_slice(&0u16.to_le_bytes());
    vk.extend_from_slice(name.as_bytes());
    cells.alloc(&vk)
}

fn serialize_key(cells: &mut Cells, key: &TestKey, root: bool) -> u32 {
    let child_offsets: Vec<u32> = key
        .children
        .iter()
        .map(|c| serialize_key(cells, c, false))
        .collect();

    let subkey_list = if child_offsets.is_empty() {
        0xffff_ffff
    } else {
        let mut lf = Vec::new();
        lf.extend_from_slice(b"lf");
        lf.extend_from_slice(&(child_offsets.len() as u16).to_le_bytes());
        for (child, offset) in key.children.iter().zip(&child_offsets) {
            lf.extend_from_slice(&offset.to_le_bytes());
            let mut hint = [0u8; 4];
            for (i, b) in child.name.bytes().take(4).enumerate() {
                hint[i] = b;
            }
            lf.extend_from_slice(&hint);
        }
        cells.alloc(&lf)
    };

    let value_offsets: Vec<u32> = key
        .values
        .iter()
        .map(|(name, value)| serialize_value(cells, name, value))
        .collect();

    let value_list = if value_offsets.is_empty() {
        0xffff_ffff
    } else {
        let list: Vec<u8> = value_offsets
            .iter()
            .flat_map(|o| o.to_le_bytes())
            .collect();
        cells.alloc(&list)
    };

    let flags = KEY_COMP_NAME | if root { KEY_HIVE_ENTRY } else { 0 };

    let mut nk = Vec::new();
    nk.extend_from_slice(b"nk");
    nk.extend_from_slice(&flags.to_le_bytes());
    nk.extend_from_slice(&[0u8; 8]); // timestamp
    nk.extend_from_slice(&0u32.to_le_bytes()); // access bits
    nk.extend_from_slice(&0u32.to_le_bytes()); // parent
    nk.extend_from_slice(&(child_offsets.len() as u32).to_le_bytes());
    nk.extend_from_slice(&0u32.to_le_bytes()); // volatile subkeys
    nk.extend_from_slice(&subkey_list.to_le_bytes());
    nk.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // volatile list
    nk.extend_from_slice(&(key.values.len() as u32).to_le_bytes());
    nk.extend_from_slice(&value_list.to_le_bytes());
    nk.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // security
    nk.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // class
    nk.extend_from_slice(&[0u8; 16]); // max-length fields
    nk.extend_from_slice(&0u32.to_le_bytes()); // work var
    nk.extend_from_slice(&(key.name.len() as u16).to_le_bytes());
    nk.extend_from_slice(&0u16.to_le_bytes()); // class name length
    nk.extend_from_slice(key.name.as_bytes());
    cells.alloc(&nk)
}

/// Serialize `root` into a complete hive file image.
pub fn build_hive(root: &TestKey) -> Vec<u8> {
    let mut cells = Cells::new();
    let root_offset = serialize_key(&mut cells, root, true);

    // Pad the bin to a page multiple and stamp the hbin header.
    let bin_size = (cells.data.len() + 0xfff) & !0xfff;
    cells.data.resize(bin_size, 0);
    cells.data[0..4].copy_from_slice(b"hbin");
    cells.data[4..8].copy_from_slice(&0u32.to_le_bytes());
    cells.data[8..12].copy_from_slice(&(bin_size as u32).to_le_bytes());

    let mut file = vec![0u8; HIVE_DATA_OFFSET];
    file[0..4].copy_from_slice(b"regf");
    file[4..8].copy_from_slice(&1u32.to_le_bytes());
    file[8..12].copy_from_slice(&1u32.to_le_bytes());
    file[20..24].copy_from_slice(&1u32.to_le_bytes()); // major
    file[24..28].copy_from_slice(&5u32.to_le_bytes()); // minor
    file[32..36].copy_from_slice(&1u32.to_le_bytes()); // format
    file[36..40].copy_from_slice(&root_offset.to_le_bytes());
    file[40..44].copy_from_slice(&(bin_size as u32).to_le_bytes());

    let mut checksum = 0u32;
    for i in 0..127 {
        let at = i * 4;
        checksum ^= u32::from_le_bytes([file[at], file[at + 1], file[at + 2], file[at + 3]]);
    }
    file[508..512].copy_from_slice(&checksum.to_le_bytes());

    file.extend_from_slice(&cells.data);
    file
}
