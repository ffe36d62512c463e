//! # API-Set Schema Resolver
//!
//! Redirects `ext-*`/`api-*` virtual DLL names to their real hosts using the
//! `.apiset` section of `ApiSetSchema.dll`. Three on-disk layouts exist —
//! Windows 8 (v2), 8.1 (v4) and 10 (v6) — but they share one shape: a
//! namespace array mapping a lowercase dotless name to a value array whose
//! first non-empty entry is the real DLL. Lookups are linear with
//! case-insensitive UTF-16 comparison, and a miss simply means "keep the
//! original name".

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use bytemuck::pod_read_unaligned;
use log::{debug, warn};

/// On-disk schema layout, selected by OS version.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchemaVersion {
    /// Windows 8.
    V2,
    /// Windows 8.1.
    V4,
    /// Windows 10.
    V6,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiSetError {
    #[error("schema blob truncated")]
    Truncated,
}

/// Whether an imported DLL name should be redirected through the schema.
#[must_use]
pub fn is_api_set_name(name: &str) -> bool {
    let lower = name.as_bytes();
    let prefix4 = |p: &[u8; 4]| {
        lower.len() > 4 && lower[..4].eq_ignore_ascii_case(p)
    };
    prefix4(b"ext-") || prefix4(b"api-")
}

/// The mapped `.apiset` blob plus its layout version.
pub struct ApiSetSchema {
    data: Vec<u8>,
    version: SchemaVersion,
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ApiSetError> {
    let slice = data
        .get(offset..offset + 4)
        .ok_or(ApiSetError::Truncated)?;
    Ok(pod_read_unaligned(slice))
}

/// Case-insensitive comparison of a UTF-16LE name against an ASCII needle.
fn utf16_eq_ignore_case(raw: &[u8], needle: &str) -> bool {
    if raw.len() != needle.len() * 2 {
        return false;
    }
    raw.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .zip(needle.bytes())
        .all(|(unit, b)| {
            let unit = match unit {
                u @ 0x41..=0x5a => u + 0x20,
                u => u,
            };
            unit == u16::from(b.to_ascii_lowercase())
        })
}

fn decode_utf16(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    char::decode_utf16(units.into_iter())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

impl ApiSetSchema {
    #[must_use]
    pub const fn new(data: Vec<u8>, version: SchemaVersion) -> Self {
        Self { data, version }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Resolve a virtual DLL name to its host DLL, or `None` when the schema
    /// holds no (usable) redirection and the caller keeps the original.
    #[must_use]
    pub fn resolve(&self, dll: &str) -> Option<String> {
        // The search key is the name up to the first dot; v2/v4 store it
        // without the `ext-`/`api-` prefix, v6 with it.
        let stem = dll.split('.').next().unwrap_or(dll);
        let stem = match self.version {
            SchemaVersion::V2 | SchemaVersion::V4 => stem.get(4..)?,
            SchemaVersion::V6 => stem,
        };

        let result = match self.version {
            SchemaVersion::V2 => self.resolve_v2(stem),
            SchemaVersion::V4 => self.resolve_v4(stem),
            SchemaVersion::V6 => self.resolve_v6(stem),
        };

        match result {
            Ok(Some(host)) => {
                debug!("api set {dll} -> {host}");
                Some(host)
            }
            Ok(None) => {
                debug!("{dll} not found in api set schema");
                None
            }
            Err(_) => {
                warn!("api set schema truncated while resolving {dll}");
                None
            }
        }
    }

    /// First value entry with a non-empty host name wins.
    fn first_host(
        &self,
        mut entry_offset: usize,
        count: u32,
        stride: usize,
        value_offset_at: usize,
    ) -> Result<Option<String>, ApiSetError> {
        for _ in 0..count {
            let value_offset = read_u32(&self.data, entry_offset + value_offset_at)? as usize;
            let value_len = read_u32(&self.data, entry_offset + value_offset_at + 4)? as usize;
            if value_len > 0 {
                let raw = self
                    .data
                    .get(value_offset..value_offset + value_len)
                    .ok_or(ApiSetError::Truncated)?;
                return Ok(Some(decode_utf16(raw)));
            }
            entry_offset += stride;
        }
        Ok(None)
    }

    /// Windows 8: `{version, count}` then `{name_off, name_len, data_off}`
    /// entries; values are `{count}` then `{name_off, name_len, value_off,
    /// value_len}`.
    fn resolve_v2(&self, stem: &str) -> Result<Option<String>, ApiSetError> {
        let count = read_u32(&self.data, 4)?;

        for i in 0..count as usize {
            let entry = 8 + i * 12;
            let name_offset = read_u32(&self.data, entry)? as usize;
            let name_len = read_u32(&self.data, entry + 4)? as usize;
            let name = self
                .data
                .get(name_offset..name_offset + name_len)
                .ok_or(ApiSetError::Truncated)?;
            if !utf16_eq_ignore_case(name, stem) {
                continue;
            }

            let values = read_u32(&self.data, entry + 8)? as usize;
            let value_count = read_u32(&self.data, values)?;
            return self.first_host(values + 4, value_count, 16, 8);
        }

        Ok(None)
    }

    /// Windows 8.1: `{version, size, flags, count}` then `{flags, name_off,
    /// name_len, alias_off, alias_len, data_off}` entries; values are
    /// `{flags, count}` then `{flags, name_off, name_len, value_off,
    /// value_len}`.
    fn resolve_v4(&self, stem: &str) -> Result<Option<String>, ApiSetError> {
        let count = read_u32(&self.data, 12)?;

        for i in 0..count as usize {
            let entry = 16 + i * 24;
            let name_offset = read_u32(&self.data, entry + 4)? as usize;
            let name_len = read_u32(&self.data, entry + 8)? as usize;
            let name = self
                .data
                .get(name_offset..name_offset + name_len)
                .ok_or(ApiSetError::Truncated)?;
            if !utf16_eq_ignore_case(name, stem) {
                continue;
            }

            let values = read_u32(&self.data, entry + 20)? as usize;
            let value_count = read_u32(&self.data, values + 4)?;
            return self.first_host(values + 8, value_count, 20, 12);
        }

        Ok(None)
    }

    /// Windows 10: `{version, size, flags, count, entry_off, hash_off,
    /// hash_factor}` header; entries `{flags, name_off, name_len,
    /// hashed_len, value_off, value_count}`; values `{flags, name_off,
    /// name_len, value_off, value_len}`.
    fn resolve_v6(&self, stem: &str) -> Result<Option<String>, ApiSetError> {
        let count = read_u32(&self.data, 12)?;
        let array = read_u32(&self.data, 16)? as usize;

        for i in 0..count as usize {
            let entry = array + i * 24;
            let name_offset = read_u32(&self.data, entry + 4)? as usize;
            let name_len = read_u32(&self.data, entry + 8)? as usize;
            let name = self
                .data
                .get(name_offset..name_offset + name_len)
                .ok_or(ApiSetError::Truncated)?;
            if !utf16_eq_ignore_case(name, stem) {
                continue;
            }

            let value_count = read_u32(&self.data, entry + 20)?;
            if value_count == 0 {
                return Ok(None);
            }
            let values = read_u32(&self.data, entry + 16)? as usize;
            return self.first_host(values, value_count, 20, 12);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    fn put32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// One-entry v6 schema: `name` (full, dotless) -> hosts.
    fn v6_schema(name: &str, hosts: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        put32(&mut buf, 0, 6); // version
        put32(&mut buf, 12, 1); // count
        put32(&mut buf, 16, 0x40); // entry array offset

        let entry = 0x40;
        put32(&mut buf, entry + 4, 0x100); // name offset
        let name_bytes = utf16(name);
        put32(&mut buf, entry + 8, name_bytes.len() as u32);
        buf[0x100..0x100 + name_bytes.len()].copy_from_slice(&name_bytes);

        put32(&mut buf, entry + 16, 0x200); // values offset
        put32(&mut buf, entry + 20, hosts.len() as u32);

        let mut string_at = 0x300;
        for (i, host) in hosts.iter().enumerate() {
            let value = 0x200 + i * 20;
            let host_bytes = utf16(host);
            put32(&mut buf, value + 12, string_at as u32);
            put32(&mut buf, value + 16, host_bytes.len() as u32);
            buf[string_at..string_at + host_bytes.len()].copy_from_slice(&host_bytes);
            string_at += host_bytes.len();
        }

        buf
    }

    /// One-entry v2 schema: `stem` (prefix-stripped) -> hosts.
    fn v2_schema(stem: &str, hosts: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        put32(&mut buf, 0, 2); // version
        put32(&mut buf, 4, 1); // count

        let entry = 8;
        put32(&mut buf, entry, 0x100);
        let name_bytes = utf16(stem);
        put32(&mut buf, entry + 4, name_bytes.len() as u32);
        buf[0x100..0x100 + name_bytes.len()].copy_from_slice(&name_bytes);
        put32(&mut buf, entry + 8, 0x200);

        put32(&mut buf, 0x200, hosts.len() as u32);
        let mut string_at = 0x300;
        for (i, host) in hosts.iter().enumerate() {
            let value = 0x204 + i * 16;
            let host_bytes = utf16(host);
            put32(&mut buf, value + 8, string_at as u32);
            put32(&mut buf, value + 12, host_bytes.len() as u32);
            buf[string_at..string_at + host_bytes.len()].copy_from_slice(&host_bytes);
            string_at += host_bytes.len();
        }

        buf
    }

    /// One-entry v4 schema.
    fn v4_schema(stem: &str, hosts: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        put32(&mut buf, 0, 4); // version
        put32(&mut buf, 12, 1); // count

        let entry = 16;
        put32(&mut buf, entry + 4, 0x100);
        let name_bytes = utf16(stem);
        put32(&mut buf, entry + 8, name_bytes.len() as u32);
        buf[0x100..0x100 + name_bytes.len()].copy_from_slice(&name_bytes);
        put32(&mut buf, entry + 20, 0x200);

        put32(&mut buf, 0x204, hosts.len() as u32);
        let mut string_at = 0x300;
        for (i, host) in hosts.iter().enumerate() {
            let value = 0x208 + i * 20;
            let host_bytes = utf16(host);
            put32(&mut buf, value + 12, string_at as u32);
            put32(&mut buf, value + 16, host_bytes.len() as u32);
            buf[string_at..string_at + host_bytes.len()].copy_from_slice(&host_bytes);
            string_at += host_bytes.len();
        }

        buf
    }

    #[test]
    fn api_set_names_are_detected_by_prefix() {
        assert!(is_api_set_name("ext-ms-win-core-example-l1-1-0.dll"));
        assert!(is_api_set_name("API-MS-Win-Core-Example-L1-1-0.dll"));
        assert!(!is_api_set_name("kernel32.dll"));
        assert!(!is_api_set_name("ext"));
    }

    #[test]
    fn v6_resolves_full_dotless_names() {
        let schema = ApiSetSchema::new(
            v6_schema("ext-ms-win-core-example-l1-1-0", &["kernel32.dll"]),
            SchemaVersion::V6,
        );

        assert_eq!(
            schema.resolve("ext-ms-win-core-example-l1-1-0.dll").as_deref(),
            Some("kernel32.dll")
        );
        // Case-insensitive.
        assert_eq!(
            schema.resolve("EXT-MS-WIN-CORE-EXAMPLE-L1-1-0.DLL").as_deref(),
            Some("kernel32.dll")
        );
        assert_eq!(schema.resolve("ext-ms-win-core-other-l1-1-0.dll"), None);
    }

    #[test]
    fn v6_skips_empty_hosts() {
        let schema = ApiSetSchema::new(
            v6_schema("ext-ms-win-core-example-l1-1-0", &["", "hal.dll"]),
            SchemaVersion::V6,
        );
        assert_eq!(
            schema.resolve("ext-ms-win-core-example-l1-1-0.dll").as_deref(),
            Some("hal.dll")
        );
    }

    #[test]
    fn v2_strips_the_prefix_before_matching() {
        let schema = ApiSetSchema::new(
            v2_schema("ms-win-core-example-l1-1-0", &["ntoskrnl.exe"]),
            SchemaVersion::V2,
        );
        assert_eq!(
            schema.resolve("ext-ms-win-core-example-l1-1-0.dll").as_deref(),
            Some("ntoskrnl.exe")
        );
    }

    #[test]
    fn v4_resolves_like_v2_with_the_wider_records() {
        let schema = ApiSetSchema::new(
            v4_schema("ms-win-core-example-l1-1-0", &["kernelbase.dll"]),
            SchemaVersion::V4,
        );
        assert_eq!(
            schema.resolve("api-ms-win-core-example-l1-1-0.dll").as_deref(),
            Some("kernelbase.dll")
        );
    }

    #[test]
    fn truncated_schema_degrades_to_no_redirection() {
        let schema = ApiSetSchema::new(vec![6, 0, 0, 0], SchemaVersion::V6);
        assert_eq!(schema.resolve("ext-ms-win-core-example-l1-1-0.dll"), None);
    }
}
