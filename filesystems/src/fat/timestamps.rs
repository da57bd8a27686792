// DOS date/time handling shared by the FAT variants.
// FAT stores a 16-bit date and 16-bit time pair; exFAT packs the same
// encoding into one DWORD plus a 10 ms refinement byte.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

/// FAT date: bits 15-9 year since 1980, 8-5 month, 4-0 day.
/// FAT time: bits 15-11 hours, 10-5 minutes, 4-0 seconds/2.
pub fn fat_datetime_to_unix(date: u16, time: u16) -> u64 {
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|dt| dt.and_utc().timestamp().max(0) as u64)
        .unwrap_or(0)
}

pub fn unix_to_fat_datetime(timestamp: u64) -> (u16, u16) {
    let dt = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(timestamp));
    let year = dt.year().clamp(1980, 2107);
    let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    let time =
        ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    (date, time)
}

pub fn now_fat_datetime() -> (u16, u16) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix_to_fat_datetime(secs)
}

/// exFAT stores date in the high word and time in the low word.
pub fn pack_exfat_datetime(date: u16, time: u16) -> u32 {
    (date as u32) << 16 | time as u32
}

pub fn unpack_exfat_datetime(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, packed as u16)
}

pub fn now_exfat_datetime() -> u32 {
    let (date, time) = now_fat_datetime();
    pack_exfat_datetime(date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_even_seconds() {
        // 2024-06-15 12:30:40 UTC
        let ts = 1_718_454_640u64;
        let (date, time) = unix_to_fat_datetime(ts);
        assert_eq!(fat_datetime_to_unix(date, time), ts);
    }

    #[test]
    fn test_odd_seconds_round_down() {
        let ts = 1_718_454_641u64;
        let (date, time) = unix_to_fat_datetime(ts);
        assert_eq!(fat_datetime_to_unix(date, time), ts - 1);
    }

    #[test]
    fn test_pre_epoch_year_clamps() {
        let (date, _) = unix_to_fat_datetime(0); // 1970 < FAT epoch
        assert_eq!(date >> 9, 0); // clamped to 1980
    }

    #[test]
    fn test_exfat_packing() {
        let (date, time) = (0x58CF, 0x6420);
        let packed = pack_exfat_datetime(date, time);
        assert_eq!(unpack_exfat_datetime(packed), (date, time));
    }

    #[test]
    fn test_invalid_date_yields_zero() {
        // Month 0 cannot be represented.
        assert_eq!(fat_datetime_to_unix(0, 0), 0);
    }
}
