//! # Registry Hive Reader
//!
//! Read-only access to an on-disk `regf` hive, plus the boot-configuration
//! queries the loader runs against the SYSTEM hive: which drivers to load
//! and in what order, which NLS files to read, and which errata INF the
//! firmware workaround table lives in.
//!
//! The hive bytes are kept intact for the whole boot: after the queries the
//! buffer is detached with [`Hive::steal_data`] and mapped into the kernel's
//! address space unchanged, because the kernel re-parses the same bytes to
//! build `\Registry\Machine\SYSTEM`.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cells;
mod hive;
mod system;
#[cfg(test)]
mod testhive;

pub use crate::hive::{Hive, KeyHandle, Value};
pub use crate::system::{BootDriver, DriverLists, NlsFileNames, SystemHive};

/// Registry value type codes.
pub const REG_NONE: u32 = 0;
pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;

/// `Type` values of interest under `Services\*`.
pub const SERVICE_KERNEL_DRIVER: u32 = 1;
pub const SERVICE_FILE_SYSTEM_DRIVER: u32 = 2;
/// `Start` value selecting boot-start services.
pub const SERVICE_BOOT_START: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("not a registry hive (bad regf signature)")]
    BadSignature,
    #[error("hive checksum mismatch")]
    BadChecksum,
    #[error("hive truncated")]
    Truncated,
    #[error("malformed hive structure: {0}")]
    Malformed(&'static str),
    #[error("key not found")]
    KeyNotFound,
    #[error("value {0} has unexpected type {1}")]
    WrongValueType(&'static str, u32),
}
