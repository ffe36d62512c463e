//! Boot-configuration queries against the SYSTEM hive: driver selection and
//! ordering, NLS file names, and the errata INF name.

use crate::hive::{Hive, KeyHandle, Value};
use crate::{HiveError, SERVICE_BOOT_START, SERVICE_FILE_SYSTEM_DRIVER, SERVICE_KERNEL_DRIVER};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, info};

/// Tag value for drivers without a `Tag`; sorts after every listed tag.
const NO_TAG: u32 = 0xffff_ffff;

/// One boot-start driver as selected from `Services\*`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootDriver {
    /// Service (key) name, e.g. `disk`.
    pub service: String,
    /// Image file name, e.g. `disk.sys`.
    pub file: String,
    /// Directory relative to `\SystemRoot\`, e.g. `system32\drivers`.
    pub dir: String,
    pub group: Option<String>,
    pub tag: u32,
}

/// Boot drivers split the way the Win8+ kernel wants them.
#[derive(Debug, Default)]
pub struct DriverLists {
    pub core: Vec<BootDriver>,
    pub boot: Vec<BootDriver>,
}

/// File names of the code-page tables to load from `system32`.
#[derive(Debug, Eq, PartialEq)]
pub struct NlsFileNames {
    pub ansi: String,
    pub oem: String,
    pub language: String,
}

/// The SYSTEM hive with `CurrentControlSet` resolved.
pub struct SystemHive {
    hive: Hive,
    ccs: KeyHandle,
    hardware_config: Option<u32>,
}

impl SystemHive {
    /// Open the hive and resolve `CurrentControlSet` via `Select\Default`.
    /// Win8 and later additionally key `StartOverride` handling off
    /// `HardwareConfig\LastId`.
    pub fn open(data: Vec<u8>, wants_hardware_config: bool) -> Result<Self, HiveError> {
        let hive = Hive::open(data)?;
        let root = hive.root()?;

        let select = hive.find_key(root, "Select")?;
        let set = match hive.query_value(select, "Default")? {
            Some(Value::Dword(set)) => set,
            Some(_) => return Err(HiveError::WrongValueType("Select\\Default", 0)),
            None => return Err(HiveError::KeyNotFound),
        };

        let ccs = hive.find_key(root, &format!("ControlSet{set:03}"))?;
        debug!("CurrentControlSet is ControlSet{set:03}");

        let hardware_config = if wants_hardware_config {
            let key = hive.find_key(root, "HardwareConfig")?;
            match hive.query_value(key, "LastId")? {
                Some(Value::Dword(id)) => Some(id),
                Some(_) => return Err(HiveError::WrongValueType("HardwareConfig\\LastId", 0)),
                None => return Err(HiveError::KeyNotFound),
            }
        } else {
            None
        };

        Ok(Self {
            hive,
            ccs,
            hardware_config,
        })
    }

    /// Borrow the underlying hive (for ad-hoc queries).
    #[must_use]
    pub const fn hive(&self) -> &Hive {
        &self.hive
    }

    /// Detach the raw hive bytes for mapping into the kernel.
    #[must_use]
    pub fn steal_data(self) -> Vec<u8> {
        self.hive.steal_data()
    }

    /// Select boot drivers from `Services\*`.
    ///
    /// A service is taken when its `Type` is kernel or filesystem driver and
    /// its `Start` is boot-start; the filesystem driver of the boot volume is
    /// always taken. `StartOverride\<HwConfig>` replaces `Start` when
    /// present.
    pub fn enumerate_boot_drivers(
        &self,
        boot_fs_driver: Option<&str>,
    ) -> Result<Vec<BootDriver>, HiveError> {
        let services = self.hive.find_key(self.ccs, "Services")?;
        let mut drivers = Vec::new();

        let mut index = 0;
        while let Some(name) = self.hive.enum_keys(services, index)? {
            index += 1;

            let key = self.hive.find_key(services, &name)?;

            let Some(Value::Dword(service_type)) = self.hive.query_value(key, "Type")? else {
                continue;
            };
            if service_type != SERVICE_KERNEL_DRIVER && service_type != SERVICE_FILE_SYSTEM_DRIVER
            {
                continue;
            }

            let is_fs_driver =
                boot_fs_driver.is_some_and(|fs| fs.eq_ignore_ascii_case(&name));

            let mut start = match self.hive.query_value(key, "Start")? {
                Some(Value::Dword(start)) => start,
                _ if is_fs_driver => SERVICE_BOOT_START,
                _ => continue,
            };

            if let Some(hwconfig) = self.hardware_config
                && !is_fs_driver
                && let Ok(so_key) = self.hive.find_key(key, "StartOverride")
                && let Some(Value::Dword(value)) =
                    self.hive.query_value(so_key, &format!("{hwconfig}"))?
            {
                start = value;
            }

            if start != SERVICE_BOOT_START && !is_fs_driver {
                continue;
            }

            let image_path = match self.hive.query_value(key, "ImagePath")? {
                Some(Value::String(path)) if !path.is_empty() => path,
                _ => format!("system32\\drivers\\{name}.sys"),
            };

            // Strip the \SystemRoot\ prefix; the loader opens everything
            // relative to the Windows directory anyway.
            let relative = image_path
                .strip_prefix("\\SystemRoot\\")
                .map_or(image_path.as_str(), |rest| rest);

            let (dir, file) = match relative.rfind('\\') {
                Some(split) => (&relative[..split], &relative[split + 1..]),
                None => ("system32\\drivers", relative),
            };

            let group = match self.hive.query_value(key, "Group")? {
                Some(Value::String(group)) => Some(group),
                _ => None,
            };

            let tag = match self.hive.query_value(key, "Tag")? {
                Some(Value::Dword(tag)) => tag,
                _ => NO_TAG,
            };

            info!("selected boot driver {name} ({dir}\\{file})");
            drivers.push(BootDriver {
                service: name,
                file: String::from(file),
                dir: String::from(dir),
                group,
                tag,
            });
        }

        Ok(drivers)
    }

    /// Order drivers by `ServiceGroupOrder\List` position, then by the
    /// group's `GroupOrderList` tag order, then by insertion order. Drivers
    /// in no listed group trail in their original order.
    pub fn sort_drivers(&self, drivers: Vec<BootDriver>) -> Result<Vec<BootDriver>, HiveError> {
        let sgo_key = self.hive.find_key(self.ccs, "Control\\ServiceGroupOrder")?;
        let Some(Value::MultiString(groups)) = self.hive.query_value(sgo_key, "List")? else {
            return Err(HiveError::WrongValueType("ServiceGroupOrder\\List", 0));
        };

        let gol_key = self.hive.find_key(self.ccs, "Control\\GroupOrderList").ok();

        let mut remaining: Vec<Option<BootDriver>> = drivers.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        for group in &groups {
            // Pull this group's drivers out, keeping insertion order.
            let mut members: Vec<BootDriver> = Vec::new();
            for slot in &mut remaining {
                if slot
                    .as_ref()
                    .and_then(|d| d.group.as_deref())
                    .is_some_and(|g| g.eq_ignore_ascii_case(group))
                {
                    members.push(slot.take().unwrap());
                }
            }

            if members.is_empty() {
                continue;
            }

            if let Some(gol_key) = gol_key
                && let Some(Value::Binary(raw)) = self.hive.query_value(gol_key, group)?
                && raw.len() >= 8
            {
                let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                let available = raw.len() / 4 - 1;
                let tags: Vec<u32> = (0..count.min(available))
                    .map(|i| {
                        let at = 4 + i * 4;
                        u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
                    })
                    .collect();

                for &tag in &tags {
                    let mut i = 0;
                    while i < members.len() {
                        if members[i].tag == tag {
                            ordered.push(members.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                }
            }

            // Tagless or unlisted tags keep their insertion order.
            ordered.append(&mut members);
        }

        ordered.extend(remaining.into_iter().flatten());
        Ok(ordered)
    }

    /// Split off the `Core` group (loaded earlier by Win8+ kernels).
    #[must_use]
    pub fn split_core_drivers(drivers: Vec<BootDriver>) -> DriverLists {
        let mut lists = DriverLists::default();
        for driver in drivers {
            if driver
                .group
                .as_deref()
                .is_some_and(|g| g.eq_ignore_ascii_case("Core"))
            {
                lists.core.push(driver);
            } else {
                lists.boot.push(driver);
            }
        }
        lists
    }

    /// Resolve the NLS table file names. `fixed_language_file` selects the
    /// 1803+ behavior where the language table is always `l_intl.nls`.
    pub fn nls_file_names(&self, fixed_language_file: bool) -> Result<NlsFileNames, HiveError> {
        let codepage = self.hive.find_key(self.ccs, "Control\\Nls\\CodePage")?;

        let ansi = self.indirect_string(codepage, "ACP")?;
        let oem = self.indirect_string(codepage, "OEMCP")?;

        let language = if fixed_language_file {
            String::from("l_intl.nls")
        } else {
            let language = self.hive.find_key(self.ccs, "Control\\Nls\\Language")?;
            self.indirect_string(language, "Default")?
        };

        Ok(NlsFileNames {
            ansi,
            oem,
            language,
        })
    }

    /// Name of the errata INF under `inf\`, from `Control\Errata` (Vista and
    /// later) or `Control\BiosInfo`.
    pub fn errata_inf_name(&self, vista_or_later: bool) -> Result<String, HiveError> {
        let key = if vista_or_later {
            self.hive.find_key(self.ccs, "Control\\Errata")?
        } else {
            self.hive.find_key(self.ccs, "Control\\BiosInfo")?
        };

        match self.hive.query_value(key, "InfName")? {
            Some(Value::String(name)) => Ok(name),
            Some(_) => Err(HiveError::WrongValueType("InfName", 0)),
            None => Err(HiveError::KeyNotFound),
        }
    }

    /// Two-step lookup: the value named `name` holds the name of the value
    /// that holds the answer (the code-page indirection scheme).
    fn indirect_string(&self, key: KeyHandle, name: &str) -> Result<String, HiveError> {
        let selector = match self.hive.query_value(key, name)? {
            Some(Value::String(s)) => s,
            Some(_) => return Err(HiveError::WrongValueType("code page selector", 0)),
            None => return Err(HiveError::KeyNotFound),
        };

        match self.hive.query_value(key, &selector)? {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(HiveError::WrongValueType("code page file", 0)),
            None => Err(HiveError::KeyNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhive::{TestKey, TestValue, build_hive};

    fn service(
        name: &str,
        service_type: u32,
        start: u32,
        group: Option<&str>,
        tag: Option<u32>,
    ) -> TestKey {
        let mut key = TestKey::new(name)
            .value("Type", TestValue::Dword(service_type))
            .value("Start", TestValue::Dword(start));
        if let Some(group) = group {
            key = key.value("Group", TestValue::Sz(String::from(group)));
        }
        if let Some(tag) = tag {
            key = key.value("Tag", TestValue::Dword(tag));
        }
        key
    }

    fn group_order_blob(tags: &[u32]) -> Vec<u8> {
        let mut blob = (tags.len() as u32).to_le_bytes().to_vec();
        for tag in tags {
            blob.extend_from_slice(&tag.to_le_bytes());
        }
        blob
    }

    fn system_hive() -> Vec<u8> {
        let services = TestKey::new("Services")
            .child(service("NetSvc", 0x10, 2, None, None)) // Win32 service, skipped
            .child(service("disk", 1, 0, Some("SCSI Class"), None))
            .child(
                service("acpiex", 1, 0, Some("Core"), None)
                    .value(
                        "ImagePath",
                        TestValue::Sz(String::from("\\SystemRoot\\system32\\drivers\\acpiex.sys")),
                    ),
            )
            .child(service("busA", 1, 0, Some("Boot Bus Extender"), Some(1)))
            .child(service("busB", 1, 0, Some("Boot Bus Extender"), Some(3)))
            .child(service("lateSvc", 1, 3, None, None)) // demand start, skipped
            .child(service("overridden", 1, 0, None, None).child(
                TestKey::new("StartOverride").value("2", TestValue::Dword(3)),
            ))
            .child(service("fastfat", 2, 3, Some("Boot File System"), None));

        let control = TestKey::new("Control")
            .child(
                TestKey::new("ServiceGroupOrder").value(
                    "List",
                    TestValue::MultiSz(alloc::vec![
                        String::from("Core"),
                        String::from("Boot Bus Extender"),
                        String::from("Boot File System"),
                        String::from("SCSI Class"),
                    ]),
                ),
            )
            .child(
                TestKey::new("GroupOrderList").value(
                    "Boot Bus Extender",
                    TestValue::Binary(group_order_blob(&[3, 1])),
                ),
            )
            .child(
                TestKey::new("Nls")
                    .child(
                        TestKey::new("CodePage")
                            .value("ACP", TestValue::Sz(String::from("1252")))
                            .value("OEMCP", TestValue::Sz(String::from("437")))
                            .value("1252", TestValue::Sz(String::from("c_1252.nls")))
                            .value("437", TestValue::Sz(String::from("c_437.nls"))),
                    )
                    .child(
                        TestKey::new("Language")
                            .value("Default", TestValue::Sz(String::from("0409")))
                            .value("0409", TestValue::Sz(String::from("l_intl.nls"))),
                    ),
            )
            .child(TestKey::new("Errata").value("InfName", TestValue::Sz(String::from("errata.inf"))));

        let root = TestKey::new("ROOT")
            .child(TestKey::new("Select").value("Default", TestValue::Dword(1)))
            .child(TestKey::new("HardwareConfig").value("LastId", TestValue::Dword(2)))
            .child(TestKey::new("ControlSet001").child(services).child(control));

        build_hive(&root)
    }

    #[test]
    fn current_control_set_is_resolved_from_select() {
        assert!(SystemHive::open(system_hive(), true).is_ok());

        // A hive whose Select points at a missing control set fails.
        let root = TestKey::new("ROOT")
            .child(TestKey::new("Select").value("Default", TestValue::Dword(9)));
        assert!(matches!(
            SystemHive::open(build_hive(&root), false),
            Err(HiveError::KeyNotFound)
        ));
    }

    #[test]
    fn only_boot_start_kernel_and_fs_drivers_are_selected() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();
        let names: Vec<_> = drivers.iter().map(|d| d.service.as_str()).collect();

        assert_eq!(names, ["disk", "acpiex", "busA", "busB"]);
    }

    #[test]
    fn boot_volume_fs_driver_is_always_selected() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(Some("fastfat")).unwrap();

        let fastfat = drivers.iter().find(|d| d.service == "fastfat").unwrap();
        assert_eq!(fastfat.file, "fastfat.sys");
        assert_eq!(fastfat.dir, "system32\\drivers");
    }

    #[test]
    fn start_override_disables_a_driver_for_this_hardware_config() {
        // hwconfig 2 overrides `overridden` to demand start.
        let system = SystemHive::open(system_hive(), true).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();
        assert!(!drivers.iter().any(|d| d.service == "overridden"));

        // Without a hardware config the override is ignored.
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();
        assert!(drivers.iter().any(|d| d.service == "overridden"));
    }

    #[test]
    fn image_path_default_and_system_root_strip() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();

        let disk = drivers.iter().find(|d| d.service == "disk").unwrap();
        assert_eq!(disk.dir, "system32\\drivers");
        assert_eq!(disk.file, "disk.sys");

        let acpiex = drivers.iter().find(|d| d.service == "acpiex").unwrap();
        assert_eq!(acpiex.dir, "system32\\drivers");
        assert_eq!(acpiex.file, "acpiex.sys");
    }

    #[test]
    fn group_order_list_tags_sort_within_a_group() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();
        let sorted = system.sort_drivers(drivers).unwrap();
        let names: Vec<_> = sorted.iter().map(|d| d.service.as_str()).collect();

        // Core first (list order), then Boot Bus Extender with tag order
        // [3, 1] putting busB before busA, then SCSI Class.
        assert_eq!(names, ["acpiex", "busB", "busA", "disk", "overridden"]);
    }

    #[test]
    fn core_group_is_split_out() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        let drivers = system.enumerate_boot_drivers(None).unwrap();
        let sorted = system.sort_drivers(drivers).unwrap();
        let lists = SystemHive::split_core_drivers(sorted);

        assert_eq!(lists.core.len(), 1);
        assert_eq!(lists.core[0].service, "acpiex");
        assert!(!lists.boot.iter().any(|d| d.service == "acpiex"));
    }

    #[test]
    fn nls_names_follow_the_indirection() {
        let system = SystemHive::open(system_hive(), false).unwrap();

        let names = system.nls_file_names(false).unwrap();
        assert_eq!(names.ansi, "c_1252.nls");
        assert_eq!(names.oem, "c_437.nls");
        assert_eq!(names.language, "l_intl.nls");

        // 1803+ pins the language table regardless of the registry.
        let names = system.nls_file_names(true).unwrap();
        assert_eq!(names.language, "l_intl.nls");
    }

    #[test]
    fn errata_inf_name_is_read_from_the_right_key() {
        let system = SystemHive::open(system_hive(), false).unwrap();
        assert_eq!(system.errata_inf_name(true).unwrap(), "errata.inf");
        assert!(system.errata_inf_name(false).is_err());
    }
}
