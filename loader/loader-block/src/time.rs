//! Firmware RTC to NT time conversion.
//!
//! NT time is 100 ns ticks since 1601-01-01; the firmware hands out a
//! calendar date. Julian-day arithmetic avoids a month table.

/// Days since the Julian epoch for a proleptic Gregorian date.
#[must_use]
pub const fn julian_day(year: u32, month: u32, day: u32) -> u32 {
    let year = year as i64;
    let month = month as i64;
    let day = day as i64;

    let a = (((month - 14) / 12 + year + 4800) * 1461) >> 2;
    let b = ((month - 14) / 12 * -12 + month - 2) * 367 / 12;
    let c = (((month - 14) / 12 + year + 4900) / 100 * 3) >> 2;

    (a + b - c + day - 32075) as u32
}

/// Julian day of 1601-01-01.
const NT_EPOCH_JULIAN_DAY: u32 = 2_305_814;

/// Convert an RTC reading to NT 100 ns ticks since 1601-01-01.
#[must_use]
pub const fn nt_time_from_rtc(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> i64 {
    let days = (julian_day(year as u32, month as u32, day as u32) - NT_EPOCH_JULIAN_DAY) as i64;

    let mut ticks = days * 86_400;
    ticks += hour as i64 * 3600 + minute as i64 * 60 + second as i64;
    ticks * 10_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn julian_day_reference_values() {
        // Known anchors: the NT epoch and the Unix epoch.
        assert_eq!(julian_day(1601, 1, 1), NT_EPOCH_JULIAN_DAY);
        assert_eq!(julian_day(1970, 1, 1), 2_440_588);
        assert_eq!(julian_day(2000, 3, 1), 2_451_605);
    }

    #[test]
    fn nt_epoch_is_zero() {
        assert_eq!(nt_time_from_rtc(1601, 1, 1, 0, 0, 0), 0);
    }

    #[test]
    fn unix_epoch_in_nt_ticks() {
        // 369 years = 134774 days.
        assert_eq!(
            nt_time_from_rtc(1970, 1, 1, 0, 0, 0),
            134_774 * 86_400 * 10_000_000
        );
    }

    #[test]
    fn time_of_day_advances_ticks() {
        let midnight = nt_time_from_rtc(2020, 6, 1, 0, 0, 0);
        let next = nt_time_from_rtc(2020, 6, 1, 1, 2, 3);
        assert_eq!(next - midnight, 3723 * 10_000_000);
    }
}
