//! Target-kernel version detection and the per-release constants hung off
//! it. Everything downstream dispatches on [`OsVersion`] exactly once; the
//! assembly routines then work through the offset table it selects.

use crate::BlockError;
use log::info;

pub const WIN32_WINNT_WS03: u16 = 0x0502;
pub const WIN32_WINNT_VISTA: u16 = 0x0600;
pub const WIN32_WINNT_WIN7: u16 = 0x0601;
pub const WIN32_WINNT_WIN8: u16 = 0x0602;
pub const WIN32_WINNT_WINBLUE: u16 = 0x0603;
pub const WIN32_WINNT_WIN10: u16 = 0x0a00;

pub const WIN10_BUILD_1507: u16 = 10240;
pub const WIN10_BUILD_1511: u16 = 10586;
pub const WIN10_BUILD_1607: u16 = 14393;
pub const WIN10_BUILD_1703: u16 = 15063;
pub const WIN10_BUILD_1709: u16 = 16299;
pub const WIN10_BUILD_1803: u16 = 17134;
pub const WIN10_BUILD_1809: u16 = 17763;
pub const WIN10_BUILD_1903: u16 = 18362;
pub const WIN10_BUILD_1909: u16 = 18363;
pub const WIN10_BUILD_2004: u16 = 19041;
pub const WIN10_BUILD_20H2: u16 = 19042;
pub const WIN10_BUILD_21H1: u16 = 19043;

/// `MajorRelease` tokens (NTDDI) the 1607+ kernels check.
pub const NTDDI_WIN10_RS1: u32 = 0x0a00_0002;
pub const NTDDI_WIN10_RS2: u32 = 0x0a00_0003;
pub const NTDDI_WIN10_RS3: u32 = 0x0a00_0004;
pub const NTDDI_WIN10_RS4: u32 = 0x0a00_0005;
pub const NTDDI_WIN10_RS5: u32 = 0x0a00_0006;
pub const NTDDI_WIN10_19H1: u32 = 0x0a00_0007;
pub const NTDDI_WIN10_20H1: u32 = 0x0a00_0008;

/// One loader-block/extension layout generation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Generation {
    Ws03,
    Vista,
    Win7,
    Win8,
    Win81,
    Win10,
}

/// The resolved target: layout generation plus the raw version triple.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OsVersion {
    pub generation: Generation,
    /// `_WIN32_WINNT`-style word, e.g. `0x0A00`.
    pub version: u16,
    pub build: u16,
    pub revision: u16,
}

impl OsVersion {
    /// Derive the target from the kernel's `VS_FIXEDFILEINFO` words.
    ///
    /// A `(major, build)` pair without a known layout is fatal: guessing a
    /// block layout gives the kernel a structure it will misread.
    pub fn detect(version_ms: u32, version_ls: u32) -> Result<Self, BlockError> {
        let mut version = ((((version_ms >> 16) & 0xffff) as u16) << 8)
            | ((version_ms & 0xff) as u16);
        let build = (version_ls >> 16) as u16;
        let revision = (version_ls & 0xffff) as u16;

        // Checked builds of 8/8.1 carry the wrong version words.
        if build == 9200 {
            version = WIN32_WINNT_WIN8;
        } else if build == 9600 {
            version = WIN32_WINNT_WINBLUE;
        } else if version == 0x0700 {
            version = WIN32_WINNT_WIN7;
        }

        let generation = match version {
            0..=WIN32_WINNT_WS03 => Generation::Ws03,
            WIN32_WINNT_VISTA => Generation::Vista,
            WIN32_WINNT_WIN7 => Generation::Win7,
            WIN32_WINNT_WIN8 => Generation::Win8,
            WIN32_WINNT_WINBLUE => Generation::Win81,
            WIN32_WINNT_WIN10 if build <= WIN10_BUILD_21H1 => Generation::Win10,
            _ => return Err(BlockError::UnsupportedVersion(version, build)),
        };

        info!(
            "target kernel {}.{}.{build}.{revision}",
            version >> 8,
            version & 0xff
        );

        Ok(Self {
            generation,
            version,
            build,
            revision,
        })
    }

    #[must_use]
    pub const fn major(&self) -> u32 {
        (self.version >> 8) as u32
    }

    #[must_use]
    pub const fn minor(&self) -> u32 {
        (self.version & 0xff) as u32
    }

    #[must_use]
    pub fn at_least(&self, generation: Generation) -> bool {
        self.generation >= generation
    }

    /// Win8+ kernels want the schema section mapped; the version selects the
    /// on-disk format.
    #[must_use]
    pub const fn api_set_schema_version(&self) -> Option<crate::ApiSetVersion> {
        match self.generation {
            Generation::Win8 => Some(crate::ApiSetVersion::V2),
            Generation::Win81 => Some(crate::ApiSetVersion::V4),
            Generation::Win10 => Some(crate::ApiSetVersion::V6),
            _ => None,
        }
    }

    /// `BootEntropyResult.maxEntropySources` for this release.
    #[must_use]
    pub const fn max_entropy_sources(&self) -> Option<u32> {
        match self.generation {
            Generation::Win8 => Some(7),
            Generation::Win81 => Some(8),
            Generation::Win10 => {
                if self.build >= WIN10_BUILD_1809 {
                    Some(10)
                } else {
                    Some(8)
                }
            }
            _ => None,
        }
    }

    /// Extension `MajorRelease` token, present from 1607 on.
    #[must_use]
    pub const fn major_release(&self) -> Option<u32> {
        if !matches!(self.generation, Generation::Win10) {
            return None;
        }
        Some(match self.build {
            WIN10_BUILD_1607..WIN10_BUILD_1703 => NTDDI_WIN10_RS1,
            WIN10_BUILD_1703..WIN10_BUILD_1709 => NTDDI_WIN10_RS2,
            WIN10_BUILD_1709..WIN10_BUILD_1803 => NTDDI_WIN10_RS3,
            WIN10_BUILD_1803..WIN10_BUILD_1809 => NTDDI_WIN10_RS4,
            WIN10_BUILD_1809..WIN10_BUILD_1903 => NTDDI_WIN10_RS5,
            // 1903 and 1909 share a value.
            WIN10_BUILD_1903..WIN10_BUILD_2004 => NTDDI_WIN10_19H1,
            WIN10_BUILD_2004..=u16::MAX => NTDDI_WIN10_20H1,
            _ => return None,
        })
    }

    /// Boot-graphics context revision used by this release.
    #[must_use]
    pub const fn boot_graphics_version(&self) -> Option<u8> {
        match self.generation {
            Generation::Win8 => Some(1),
            Generation::Win81 => Some(2),
            Generation::Win10 => {
                if self.build >= WIN10_BUILD_1803 {
                    Some(4)
                } else if self.build >= WIN10_BUILD_1703 {
                    Some(3)
                } else {
                    Some(2)
                }
            }
            _ => None,
        }
    }

    /// Whether the x86 PCR still lives at the fixed `KIP0PCRADDRESS`.
    #[must_use]
    pub const fn fixed_x86_pcr(&self) -> bool {
        self.build < WIN10_BUILD_1703
    }

    /// NLS language table: fixed `l_intl.nls` from 1803 on.
    #[must_use]
    pub const fn fixed_language_file(&self) -> bool {
        self.build >= WIN10_BUILD_1803
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(major: u16, minor: u16, build: u16, revision: u16) -> OsVersion {
        OsVersion::detect(
            (u32::from(major) << 16) | u32::from(minor),
            (u32::from(build) << 16) | u32::from(revision),
        )
        .unwrap()
    }

    #[test]
    fn known_builds_map_to_their_generation() {
        assert_eq!(detect(5, 2, 3790, 3959).generation, Generation::Ws03);
        assert_eq!(detect(6, 0, 6002, 18005).generation, Generation::Vista);
        assert_eq!(detect(6, 1, 7601, 17514).generation, Generation::Win7);
        assert_eq!(detect(6, 2, 9200, 16384).generation, Generation::Win8);
        assert_eq!(detect(6, 3, 9600, 17415).generation, Generation::Win81);
        assert_eq!(detect(10, 0, 17763, 1).generation, Generation::Win10);
    }

    #[test]
    fn checked_build_version_words_are_corrected() {
        // 6.2.9600 in the header still means 8.1.
        let v = detect(6, 2, 9600, 17415);
        assert_eq!(v.generation, Generation::Win81);
        assert_eq!(v.version, WIN32_WINNT_WINBLUE);
    }

    #[test]
    fn future_builds_are_rejected() {
        assert!(matches!(
            OsVersion::detect(0x000a_0000, (22000u32) << 16),
            Err(BlockError::UnsupportedVersion(..))
        ));
    }

    #[test]
    fn major_release_tokens_follow_the_build() {
        assert_eq!(detect(10, 0, 14393, 0).major_release(), Some(NTDDI_WIN10_RS1));
        assert_eq!(detect(10, 0, 17763, 0).major_release(), Some(NTDDI_WIN10_RS5));
        assert_eq!(detect(10, 0, 18362, 0).major_release(), Some(NTDDI_WIN10_19H1));
        assert_eq!(detect(10, 0, 18363, 0).major_release(), Some(NTDDI_WIN10_19H1));
        assert_eq!(detect(10, 0, 19043, 0).major_release(), Some(NTDDI_WIN10_20H1));
        assert_eq!(detect(10, 0, 10240, 0).major_release(), None);
        assert_eq!(detect(6, 3, 9600, 0).major_release(), None);
    }

    #[test]
    fn entropy_source_counts_per_release() {
        assert_eq!(detect(6, 2, 9200, 0).max_entropy_sources(), Some(7));
        assert_eq!(detect(6, 3, 9600, 0).max_entropy_sources(), Some(8));
        assert_eq!(detect(10, 0, 17134, 0).max_entropy_sources(), Some(8));
        assert_eq!(detect(10, 0, 17763, 0).max_entropy_sources(), Some(10));
        assert_eq!(detect(6, 1, 7601, 0).max_entropy_sources(), None);
    }
}
