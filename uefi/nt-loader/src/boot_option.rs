//! Boot option selection.
//!
//! The interactive menu is a separate application; its contract with this
//! loader is a `SystemPath` plus an option string. They are read from
//! `\ntboot.cfg` on the loader's own volume: the first non-empty line is
//! the ARC system path, the remainder joins into the option string.
//! Menu-style `/KEY` options are normalized to the space-separated form.

use crate::file_system::load_boot_file;
use alloc::string::String;
use alloc::vec::Vec;
use loader_options::normalize_options;
use log::info;
use uefi::{Status, cstr16};

pub struct BootOption {
    /// E.g. `multi(0)disk(0)rdisk(0)partition(2)\Windows`.
    pub system_path: String,
    /// Kernel options, space separated.
    pub options: String,
}

pub fn select() -> Result<BootOption, Status> {
    let raw = load_boot_file(cstr16!("\\ntboot.cfg"))?;
    let text = core::str::from_utf8(&raw).map_err(|_| Status::UNSUPPORTED)?;

    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    let system_path = String::from(lines.next().ok_or(Status::NOT_FOUND)?);
    let options: Vec<&str> = lines.collect();
    let options = normalize_options(&options.join(" "));

    info!("booting {system_path}");
    if !options.is_empty() {
        info!("options: {options}");
    }

    Ok(BootOption {
        system_path,
        options,
    })
}
