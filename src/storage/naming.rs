//! Chunk file naming
//!
//! Chunk names encode wall-clock time of creation plus the persisted
//! monotonic counter: `HHMMSS_NNNNN.bin`. The counter alone guarantees
//! uniqueness, the time is for humans and for the retrieval file tag.

use chrono::{Local, NaiveTime, Timelike};
use parking_lot::Mutex;
use std::fmt;

const CHUNK_EXTENSION: &str = ".bin";

/// Identity of one chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkName {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub counter: u32,
}

impl ChunkName {
    pub fn new(time: NaiveTime, counter: u32) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
            counter,
        }
    }

    /// File name without directory
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Path relative to the medium root
    pub fn path(&self) -> String {
        format!("{}/{}", crate::constants::AUDIO_DIR, self)
    }

    /// Parse a directory entry; anything else in the directory yields `None`
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(CHUNK_EXTENSION)?;
        let (time, counter) = stem.split_once('_')?;
        if time.len() != 6 || !time.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hour: u8 = time[0..2].parse().ok()?;
        let minute: u8 = time[2..4].parse().ok()?;
        let second: u8 = time[4..6].parse().ok()?;
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        Some(Self {
            hour,
            minute,
            second,
            counter: counter.parse().ok()?,
        })
    }

    /// 32-bit tag prefixed to multi-file retrieval packets: seconds of day
    pub fn file_tag(&self) -> u32 {
        self.hour as u32 * 3600 + self.minute as u32 * 60 + self.second as u32
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}{:02}{:02}_{:05}{}",
            self.hour, self.minute, self.second, self.counter, CHUNK_EXTENSION
        )
    }
}

/// Wall-clock source for chunk names
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Local time of day
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Settable clock for tests and the simulator
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<NaiveTime>,
}

impl FixedClock {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    pub fn at(hour: u32, minute: u32, second: u32) -> Self {
        Self::new(NaiveTime::from_hms_opt(hour, minute, second).unwrap_or(NaiveTime::MIN))
    }

    pub fn set(&self, time: NaiveTime) {
        *self.time.lock() = time;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut time = self.time.lock();
        *time = *time + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        *self.time.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let name = ChunkName::new(NaiveTime::from_hms_opt(9, 5, 7).unwrap(), 42);
        assert_eq!(name.file_name(), "090507_00042.bin");
        assert_eq!(name.path(), "audio/090507_00042.bin");
        assert_eq!(ChunkName::parse("090507_00042.bin"), Some(name));
    }

    #[test]
    fn test_large_counter_widens() {
        let name = ChunkName::new(NaiveTime::MIN, 1_234_567);
        assert_eq!(name.file_name(), "000000_1234567.bin");
        assert_eq!(ChunkName::parse(&name.file_name()).unwrap().counter, 1_234_567);
    }

    #[test]
    fn test_rejects_foreign_names() {
        for name in [
            "counter.bin",
            "090507_00042.txt",
            "0905_00042.bin",
            "250000_00001.bin",
            "090507_.bin",
            "09a507_00001.bin",
        ] {
            assert_eq!(ChunkName::parse(name), None, "{}", name);
        }
    }

    #[test]
    fn test_file_tag_is_seconds_of_day() {
        let name = ChunkName::new(NaiveTime::from_hms_opt(1, 2, 3).unwrap(), 1);
        assert_eq!(name.file_tag(), 3723);
    }

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::at(23, 59, 50);
        clock.advance(chrono::Duration::seconds(15));
        assert_eq!(clock.now(), NaiveTime::from_hms_opt(0, 0, 5).unwrap());
    }
}
