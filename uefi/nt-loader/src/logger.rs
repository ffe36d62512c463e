//! Console logger for the `log` facade. Output stops once boot services are
//! gone; the last stretch before the jump is silent by design.

use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Log, Metadata, Record};

static BOOT_SERVICES_ACTIVE: AtomicBool = AtomicBool::new(true);
static LOGGER: ConsoleLogger = ConsoleLogger;

pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn install(max_level: LevelFilter) {
        // A second install attempt is harmless; the first logger wins.
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(max_level);
    }

    /// Call right before `ExitBootServices`; console protocols die with it.
    pub fn exit_boot_services() {
        BOOT_SERVICES_ACTIVE.store(false, Ordering::Relaxed);
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if BOOT_SERVICES_ACTIVE.load(Ordering::Relaxed) {
            uefi::println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}
