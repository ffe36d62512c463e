//! Small firmware services: TSC calibration, RTC reads, the cookie seed,
//! and the fatal-error key wait.

use loader_block::time::nt_time_from_rtc;
use log::warn;
use uefi::boot;
use uefi::runtime;

/// Measure the TSC frequency in Hz by reading the counter around a 50 ms
/// firmware stall.
#[must_use]
pub fn measure_cpu_frequency() -> u64 {
    const DELAY_MS: u64 = 50;

    let t0 = tsc();
    boot::stall(DELAY_MS as usize * 1000);
    let t1 = tsc();

    (t1.wrapping_sub(t0)) * (1000 / DELAY_MS)
}

fn tsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Current time as NT 100 ns ticks since 1601-01-01, or zero when the RTC
/// cannot be read.
#[must_use]
pub fn system_time() -> i64 {
    match runtime::get_time() {
        Ok(time) => nt_time_from_rtc(
            time.year(),
            time.month(),
            time.day(),
            time.hour(),
            time.minute(),
            time.second(),
        ),
        Err(e) => {
            warn!("GetTime failed: {e:?}");
            0
        }
    }
}

/// Seed for the image security cookies. Matches the shipping loader in
/// deriving it from the clock; it is not security-relevant at this stage.
#[must_use]
pub fn random_seed() -> u32 {
    match runtime::get_time() {
        Ok(time) => {
            let mut seed = (u32::from(time.year()) << 16)
                | (u32::from(time.month()) << 8)
                | u32::from(time.day());
            seed ^= (u32::from(time.hour()) << 16)
                | (u32::from(time.minute()) << 8)
                | u32::from(time.second());
            seed ^ time.nanosecond()
        }
        Err(_) => 0,
    }
}

/// Identity address of the runtime-services `GetTime` slot (the first
/// service pointer after the table header); the kernel gets its virtual
/// alias through `VirtualEfiRuntimeServices`.
#[must_use]
pub fn runtime_services_get_time_slot() -> u64 {
    const TABLE_HEADER_SIZE: u64 = 24;

    // SAFETY: the system table outlives the loader.
    let rt = uefi::table::system_table_raw()
        .map(|st| unsafe { st.as_ref().runtime_services })
        .unwrap_or(core::ptr::null_mut());
    if rt.is_null() {
        return 0;
    }
    rt as u64 + TABLE_HEADER_SIZE
}

/// Block until any key press (fatal-error halt).
pub fn wait_for_key() {
    uefi::println!("Press any key to return to the firmware.");
    uefi::system::with_stdin(|stdin| {
        if let Some(event) = stdin.wait_for_key_event() {
            let mut events = [event];
            let _ = boot::wait_for_event(&mut events);
        }
    });
}
