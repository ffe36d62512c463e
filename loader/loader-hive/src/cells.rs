//! Raw `regf` cell records.

use bytemuck::{AnyBitPattern, Pod, Zeroable};

pub const REGF_SIGNATURE: u32 = 0x6667_6572; // "regf"
pub const HBIN_SIGNATURE: u32 = 0x6e69_6268; // "hbin"

pub const NK_SIGNATURE: u16 = 0x6b6e; // "nk"
pub const VK_SIGNATURE: u16 = 0x6b76; // "vk"
pub const LF_SIGNATURE: u16 = 0x666c; // "lf"
pub const LH_SIGNATURE: u16 = 0x686c; // "lh"
pub const LI_SIGNATURE: u16 = 0x696c; // "li"
pub const RI_SIGNATURE: u16 = 0x6972; // "ri"

/// Key node flag: the name is stored as Latin-1 instead of UTF-16.
pub const KEY_COMP_NAME: u16 = 0x0020;
/// Key node flag: root of the hive.
pub const KEY_HIVE_ENTRY: u16 = 0x0004;
/// Value flag: the name is stored as Latin-1.
pub const VALUE_COMP_NAME: u16 = 0x0001;
/// Data-size bit: the value data lives inline in the offset field.
pub const VALUE_DATA_INLINE: u32 = 0x8000_0000;

/// Offset of the hive data area (cell offsets are relative to this).
pub const HIVE_DATA_OFFSET: usize = 0x1000;

/// First 512 bytes of the file. The timestamp is kept as two words so the
/// record stays padding-free under `repr(C)`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BaseBlock {
    pub signature: u32,
    pub sequence1: u32,
    pub sequence2: u32,
    pub timestamp_low: u32,
    pub timestamp_high: u32,
    pub major: u32,
    pub minor: u32,
    pub file_type: u32,
    pub format: u32,
    pub root_cell: u32,
    pub hive_bins_size: u32,
    pub clustering_factor: u32,
}

/// Key node (`nk`) fixed part; the name follows it.
#[repr(C)]
#[derive(Copy, Clone, AnyBitPattern)]
pub struct KeyNode {
    pub signature: u16,
    pub flags: u16,
    pub timestamp_low: u32,
    pub timestamp_high: u32,
    pub access_bits: u32,
    pub parent: u32,
    pub subkey_count: u32,
    pub volatile_subkey_count: u32,
    pub subkey_list: u32,
    pub volatile_subkey_list: u32,
    pub value_count: u32,
    pub value_list: u32,
    pub security: u32,
    pub class: u32,
    pub max_name_len: u32,
    pub max_class_len: u32,
    pub max_value_name_len: u32,
    pub max_value_data_len: u32,
    pub work_var: u32,
    pub name_len: u16,
    pub class_len: u16,
}

/// Value record (`vk`) fixed part; the name follows it.
#[repr(C)]
#[derive(Copy, Clone, AnyBitPattern)]
pub struct ValueRecord {
    pub signature: u16,
    pub name_len: u16,
    pub data_size: u32,
    pub data_offset: u32,
    pub data_type: u32,
    pub flags: u16,
    pub spare: u16,
}
