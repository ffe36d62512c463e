//! # Boot Option Grammar
//!
//! Two small parsers shared by the boot pipeline:
//!
//! - the ARC device path `multi(0)disk(0)rdisk(<disk>)partition(<part>)`
//!   the NT kernel uses to re-identify its boot volume (non-conventional
//!   volumes carry whatever name their driver reports, e.g.
//!   `btrfs(<uuid>)`), and
//! - the whitespace-separated `KEY=value` boot command line. Unrecognized
//!   tokens are not errors; they travel to the kernel verbatim through
//!   `LoadOptions`.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::format;
use alloc::string::String;
use core::fmt::Write;
use log::warn;

/// NX policy from `NOEXECUTE=`; only consulted on x86.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum NxPolicy {
    #[default]
    OptIn,
    OptOut,
    AlwaysOff,
    AlwaysOn,
}

/// PAE policy from `PAE`/`NOPAE`; only consulted on x86.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PaePolicy {
    #[default]
    Default,
    ForceEnable,
    ForceDisable,
}

/// Parsed boot options. Everything is optional; the raw option string is
/// separately stored into the loader block untouched.
#[derive(Clone, Debug, Default)]
pub struct CommandLine {
    /// Debug transport, lowercased, with `comN` collapsed to `com`.
    pub debug_type: Option<String>,
    /// `HAL=` override file name.
    pub hal: Option<String>,
    /// `KERNEL=` override file name.
    pub kernel: Option<String>,
    /// `SUBVOL=` snapshot id (hex).
    pub subvol: u64,
    pub pae: PaePolicy,
    pub nx: NxPolicy,
}

impl CommandLine {
    /// Parse a whitespace-separated option string.
    #[must_use]
    pub fn parse(options: &str) -> Self {
        let mut cmdline = Self::default();
        for token in options.split(' ').filter(|t| !t.is_empty()) {
            cmdline.parse_token(token);
        }
        cmdline
    }

    fn parse_token(&mut self, token: &str) {
        if let Some(value) = strip_key(token, "DEBUGPORT=") {
            let mut debug_type: String = value.to_ascii_lowercase();
            // `com3` selects the transport `com`; the port number only
            // matters to the kernel.
            if debug_type.starts_with("com")
                && debug_type.len() > 3
                && debug_type[3..].bytes().all(|b| b.is_ascii_digit())
            {
                debug_type.truncate(3);
            }
            self.debug_type = Some(debug_type);
        } else if let Some(value) = strip_key(token, "HAL=") {
            self.hal = Some(String::from(value));
        } else if let Some(value) = strip_key(token, "KERNEL=") {
            self.kernel = Some(String::from(value));
        } else if let Some(value) = strip_key(token, "SUBVOL=") {
            match u64::from_str_radix(value, 16) {
                Ok(subvol) => self.subvol = subvol,
                Err(_) => warn!("malformed SUBVOL value {value}"),
            }
        } else if token.eq_ignore_ascii_case("PAE") {
            self.pae = PaePolicy::ForceEnable;
        } else if token.eq_ignore_ascii_case("NOPAE") {
            self.pae = PaePolicy::ForceDisable;
        } else if let Some(value) = strip_key(token, "NOEXECUTE=") {
            if value.eq_ignore_ascii_case("OPTIN") {
                self.nx = NxPolicy::OptIn;
            } else if value.eq_ignore_ascii_case("OPTOUT") {
                self.nx = NxPolicy::OptOut;
            } else if value.eq_ignore_ascii_case("ALWAYSOFF") {
                self.nx = NxPolicy::AlwaysOff;
            } else if value.eq_ignore_ascii_case("ALWAYSON") {
                self.nx = NxPolicy::AlwaysOn;
            }
        }
        // Anything else passes through via LoadOptions.
    }
}

fn strip_key<'a>(token: &'a str, key: &str) -> Option<&'a str> {
    if token.len() > key.len() && token[..key.len()].eq_ignore_ascii_case(key) {
        Some(&token[key.len()..])
    } else {
        None
    }
}

/// A conventional ARC partition path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArcPartition {
    pub disk: u32,
    pub partition: u32,
}

impl ArcPartition {
    /// Render `multi(0)disk(0)rdisk(<disk>)partition(<part>)`.
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "multi(0)disk(0)rdisk({})partition({})",
            self.disk, self.partition
        )
    }

    /// Parse a conventional ARC name; `None` for every other volume naming
    /// scheme (those are matched against the driver-reported name instead).
    #[must_use]
    pub fn parse(arc_name: &str) -> Option<Self> {
        let rest = arc_name.strip_prefix("multi(0)disk(0)rdisk(")?;
        let close = rest.find(')')?;
        let disk: u32 = rest[..close].parse().ok()?;

        let rest = rest[close + 1..].strip_prefix("partition(")?;
        let close = rest.find(')')?;
        let partition: u32 = rest[..close].parse().ok()?;

        if rest[close + 1..].is_empty() {
            Some(Self { disk, partition })
        } else {
            None
        }
    }
}

/// Split a `SystemPath` like `multi(0)...partition(2)\Windows` into the
/// volume part and the (backslash-stripped) directory part.
#[must_use]
pub fn split_system_path(system_path: &str) -> (&str, &str) {
    match system_path.find('\\') {
        Some(at) => (&system_path[..at], system_path[at..].trim_start_matches('\\')),
        None => (system_path, ""),
    }
}

/// Normalize menu-style options (`/DEBUGPORT=...`) into the space-separated
/// form the kernel expects in `LoadOptions`.
#[must_use]
pub fn normalize_options(options: &str) -> String {
    let mut out = String::with_capacity(options.len());
    for c in options.chars() {
        if c == '/' {
            out.write_char(' ').ok();
        } else {
            out.write_char(c).ok();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_round_trip() {
        let arc = ArcPartition {
            disk: 3,
            partition: 14,
        };
        let name = arc.format();
        assert_eq!(name, "multi(0)disk(0)rdisk(3)partition(14)");
        assert_eq!(ArcPartition::parse(&name), Some(arc));
    }

    #[test]
    fn non_conventional_names_do_not_parse() {
        assert_eq!(ArcPartition::parse("btrfs(12345678-abcd)"), None);
        assert_eq!(ArcPartition::parse("multi(0)disk(0)rdisk(1)"), None);
        assert_eq!(
            ArcPartition::parse("multi(0)disk(0)rdisk(1)partition(2)trailing"),
            None
        );
    }

    #[test]
    fn system_path_splits_at_the_first_backslash() {
        let (volume, path) = split_system_path("multi(0)disk(0)rdisk(0)partition(1)\\Windows");
        assert_eq!(volume, "multi(0)disk(0)rdisk(0)partition(1)");
        assert_eq!(path, "Windows");

        let (volume, path) = split_system_path("btrfs(ab)");
        assert_eq!(volume, "btrfs(ab)");
        assert_eq!(path, "");
    }

    #[test]
    fn debugport_is_lowercased_and_com_ports_collapse() {
        let cmdline = CommandLine::parse("DEBUGPORT=COM1");
        assert_eq!(cmdline.debug_type.as_deref(), Some("com"));

        let cmdline = CommandLine::parse("debugport=NET");
        assert_eq!(cmdline.debug_type.as_deref(), Some("net"));

        let cmdline = CommandLine::parse("DEBUGPORT=1394");
        assert_eq!(cmdline.debug_type.as_deref(), Some("1394"));
    }

    #[test]
    fn overrides_and_subvol() {
        let cmdline = CommandLine::parse("HAL=halacpi.dll KERNEL=ntkrnlmp.exe SUBVOL=1a2b");
        assert_eq!(cmdline.hal.as_deref(), Some("halacpi.dll"));
        assert_eq!(cmdline.kernel.as_deref(), Some("ntkrnlmp.exe"));
        assert_eq!(cmdline.subvol, 0x1a2b);
    }

    #[test]
    fn pae_and_nx_policies() {
        let cmdline = CommandLine::parse("NOPAE NOEXECUTE=ALWAYSOFF");
        assert_eq!(cmdline.pae, PaePolicy::ForceDisable);
        assert_eq!(cmdline.nx, NxPolicy::AlwaysOff);

        let cmdline = CommandLine::parse("PAE NOEXECUTE=OPTOUT");
        assert_eq!(cmdline.pae, PaePolicy::ForceEnable);
        assert_eq!(cmdline.nx, NxPolicy::OptOut);
    }

    #[test]
    fn unknown_tokens_are_ignored_not_rejected() {
        let cmdline = CommandLine::parse("BOOTLOG SOS QUIETBOOT");
        assert_eq!(cmdline.debug_type, None);
        assert_eq!(cmdline.subvol, 0);
    }

    #[test]
    fn slashes_normalize_to_spaces() {
        assert_eq!(
            normalize_options("/DEBUGPORT=COM1/SOS"),
            " DEBUGPORT=COM1 SOS"
        );
    }
}
