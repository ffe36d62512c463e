//! # UEFI Loader for Windows NT Kernels
//!
//! Boots an unmodified NT kernel (Server 2003 through Windows 10 21H1) from
//! UEFI firmware. The firmware exposes none of the BIOS-era services the
//! kernel's shipping loader environment provides, so everything is
//! synthesized here: the SYSTEM hive is parsed for boot drivers, PE images
//! are loaded and cross-linked, the version-specific loader parameter block
//! is assembled, a custom page table and descriptor tables are installed,
//! and control transfers to `KiSystemStartup` with preconditions identical
//! to those of `winload.efi`.
//!
//! The heavy lifting lives in the library crates (`loader-pe`,
//! `loader-hive`, `loader-apiset`, `loader-block`, `loader-images`,
//! `loader-vmem`); this application supplies the firmware plumbing and the
//! final handoff.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod boot;
mod boot_option;
mod context;
mod debug;
mod file_system;
mod firmware;
mod gdt;
mod graphics;
mod handoff;
mod hw;
mod logger;
mod memory;
mod memory_map;

use crate::logger::ConsoleLogger;
use log::{LevelFilter, error};
use uefi::prelude::*;

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    ConsoleLogger::install(LevelFilter::Info);

    let status = match boot_option::select() {
        Ok(option) => match boot::boot(&option) {
            // `boot` only returns on failure; success never comes back.
            Err(error) => {
                error!("{} returned {:?}", error.operation, error.status);
                error!("{}", error.message);
                error.status
            }
            Ok(never) => match never {},
        },
        Err(status) => {
            error!("no usable boot option ({status:?})");
            status
        }
    };

    // Fatal error: report, wait for a key, bounce back to the firmware.
    firmware::wait_for_key();
    status
}
