//! IRIG-style time tags
//!
//! The engine clock counts quarter microseconds. Time tags are recorded in
//! two monitor words (high: day/hour/minute, low: second/microsecond) and as
//! a running microsecond count inside status queue entries.

use bitfield::bitfield;

/// Engine clock ticks per microsecond
pub const TICKS_PER_MICRO: u64 = 4;

const MICROS_PER_SECOND: u64 = 1_000_000;
const MICROS_PER_MINUTE: u64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: u64 = 60 * MICROS_PER_MINUTE;
const MICROS_PER_DAY: u64 = 24 * MICROS_PER_HOUR;

bitfield! {
    /// Time tag high word as stored in the monitor ring
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TimeTagHigh(u32);
    impl Debug;
    pub u8, entry_type, set_entry_type: 31, 28;
    pub u16, days, set_days: 19, 11;
    pub u8, hours, set_hours: 10, 6;
    pub u8, minutes, set_minutes: 5, 0;
}

bitfield! {
    /// Time tag low word as stored in the monitor ring
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TimeTagLow(u32);
    impl Debug;
    pub u8, entry_type, set_entry_type: 31, 28;
    pub u8, seconds, set_seconds: 25, 20;
    pub u32, micros, set_micros: 19, 0;
}

/// Decoded time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeTag {
    /// Day of year, starting at 1
    pub days: u16,
    /// Hour (0-23)
    pub hours: u8,
    /// Minute (0-59)
    pub minutes: u8,
    /// Second (0-59)
    pub seconds: u8,
    /// Microsecond (0-999999)
    pub micros: u32,
}

impl TimeTag {
    /// Convert an engine tick count to a time tag
    pub fn from_ticks(ticks: u64) -> Self {
        let total = ticks / TICKS_PER_MICRO;
        let day = total / MICROS_PER_DAY;
        let rem = total % MICROS_PER_DAY;
        TimeTag {
            days: ((day % 511) + 1) as u16,
            hours: (rem / MICROS_PER_HOUR) as u8,
            minutes: ((rem % MICROS_PER_HOUR) / MICROS_PER_MINUTE) as u8,
            seconds: ((rem % MICROS_PER_MINUTE) / MICROS_PER_SECOND) as u8,
            micros: (rem % MICROS_PER_SECOND) as u32,
        }
    }

    /// Microseconds since the start of day one
    pub fn total_micros(&self) -> u64 {
        (self.days.saturating_sub(1) as u64) * MICROS_PER_DAY
            + self.hours as u64 * MICROS_PER_HOUR
            + self.minutes as u64 * MICROS_PER_MINUTE
            + self.seconds as u64 * MICROS_PER_SECOND
            + self.micros as u64
    }

    /// Encode the monitor high word with the given entry type tag
    pub fn high_word(&self, entry_type: u8) -> u32 {
        let mut word = TimeTagHigh(0);
        word.set_entry_type(entry_type);
        word.set_days(self.days);
        word.set_hours(self.hours);
        word.set_minutes(self.minutes);
        word.0
    }

    /// Encode the monitor low word with the given entry type tag
    pub fn low_word(&self, entry_type: u8) -> u32 {
        let mut word = TimeTagLow(0);
        word.set_entry_type(entry_type);
        word.set_seconds(self.seconds);
        word.set_micros(self.micros);
        word.0
    }

    /// Rebuild a time tag from a monitor high/low pair
    pub fn from_words(high: u32, low: u32) -> Self {
        let high = TimeTagHigh(high);
        let low = TimeTagLow(low);
        TimeTag {
            days: high.days(),
            hours: high.hours(),
            minutes: high.minutes(),
            seconds: low.seconds(),
            micros: low.micros(),
        }
    }

    /// Single-word form used in status queue entries
    ///
    /// Microseconds since the start of day one, modulo 2^32 (about 71.6
    /// minutes between wraps).
    pub fn queue_word(&self) -> u32 {
        self.total_micros() as u32
    }
}

impl std::fmt::Display for TimeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:03}:{:02}:{:02}:{:02}.{:06}",
            self.days, self.hours, self.minutes, self.seconds, self.micros
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ticks() {
        let ticks = (3_600_000_000 + 61_000_123) * TICKS_PER_MICRO;
        let tag = TimeTag::from_ticks(ticks);
        assert_eq!(tag.days, 1);
        assert_eq!(tag.hours, 1);
        assert_eq!(tag.minutes, 1);
        assert_eq!(tag.seconds, 1);
        assert_eq!(tag.micros, 123);
        assert_eq!(tag.total_micros(), 3_661_000_123);
    }

    #[test]
    fn test_monitor_word_layout() {
        let tag = TimeTag {
            days: 2,
            hours: 3,
            minutes: 4,
            seconds: 5,
            micros: 6,
        };
        let high = tag.high_word(3);
        let low = tag.low_word(2);
        assert_eq!(high, 0x3000_0000 | (2 << 11) | (3 << 6) | 4);
        assert_eq!(low, 0x2000_0000 | (5 << 20) | 6);
        assert_eq!(TimeTag::from_words(high, low), tag);
    }

    #[test]
    fn test_queue_word() {
        let tag = TimeTag {
            days: 1,
            hours: 0,
            minutes: 2,
            seconds: 3,
            micros: 0x12345,
        };
        assert_eq!(tag.queue_word(), 123_000_000 + 0x12345);
    }

    #[test]
    fn test_queue_word_increases_across_the_hour() {
        let before = TimeTag::from_ticks((3_600_000_000 - 1) * TICKS_PER_MICRO);
        let after = TimeTag::from_ticks(3_600_000_000 * TICKS_PER_MICRO);
        assert_eq!(after.queue_word() - before.queue_word(), 1);
    }

    #[test]
    fn test_display() {
        let tag = TimeTag::from_ticks(4 * 1_500_000);
        assert_eq!(tag.to_string(), "001:00:00:01.500000");
    }
}
