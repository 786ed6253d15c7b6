//! WAL segment identifiers and the segment range a base backup depends on.
//!
//! A segment file name is 24 hex digits: timeline, high counter and low counter, eight
//! digits each. Ranges iterate the `(high, low)` pair and keep the leading eight digits
//! of the starting segment.

use std::fmt;
use std::str::FromStr;

use crate::utils::{BackupError, Result};

/// Highest low-counter value before the high counter rolls over.
///
/// 16MB segments give 0xFF segments per log id on PostgreSQL 9.3 and later. Older variants
/// of this tool used 0xFFFFFFFF; ranges crossing a log id boundary differ between the two.
pub const DEFAULT_WAL_SEGMENT_MAX: u32 = 0x0000_00FF;

/// Suffix WAL-E appends to archived segments.
pub const WAL_SUFFIX: &str = ".lzo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalId {
    timeline: u32,
    high: u32,
    low: u32,
}

impl WalId {
    pub fn new(timeline: u32, high: u32, low: u32) -> Self {
        Self {
            timeline,
            high,
            low,
        }
    }

    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    /// `(high, low)` counter pair used for range ordering
    pub fn position(&self) -> (u32, u32) {
        (self.high, self.low)
    }

    /// Archived object name, e.g. `00000001000009D6000000D0.lzo`
    pub fn file_name(&self) -> String {
        format!("{}{}", self, WAL_SUFFIX)
    }
}

impl fmt::Display for WalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.high, self.low)
    }
}

impl FromStr for WalId {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || BackupError::MalformedWalId(s.to_string());
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let group = |i: usize| u32::from_str_radix(&s[i * 8..(i + 1) * 8], 16).map_err(|_| malformed());
        Ok(Self {
            timeline: group(0)?,
            high: group(1)?,
            low: group(2)?,
        })
    }
}

/// Every segment from `start` through `end`.
///
/// The current segment is emitted before it is compared with `end`, so `start == end`
/// yields one segment and a range never comes back empty. When the low counter passes
/// `segment_max` it wraps to zero and the high counter advances.
pub fn wal_range(start: WalId, end: WalId, segment_max: u32) -> Vec<WalId> {
    let stop = end.position();
    let (mut high, mut low) = start.position();
    let mut segments = Vec::new();

    loop {
        segments.push(WalId::new(start.timeline, high, low));
        if (high, low) >= stop {
            break;
        }
        if low >= segment_max {
            low = 0;
            high += 1;
        } else {
            low += 1;
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> WalId {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let wal = id("00000001000009D6000000D0");
        assert_eq!(wal.timeline(), 1);
        assert_eq!(wal.position(), (0x9D6, 0xD0));
        assert_eq!(wal.to_string(), "00000001000009D6000000D0");
        assert_eq!(wal.file_name(), "00000001000009D6000000D0.lzo");
    }

    #[test]
    fn test_lowercase_is_canonicalised() {
        assert_eq!(id("00000001000009d6000000d0").to_string(), "00000001000009D6000000D0");
    }

    #[test]
    fn test_malformed_ids() {
        for bad in ["", "00000001000009D6000000D", "00000001000009D6000000D00", "00000001000009D6000000DZ", "+0000001000009D6000000D0"] {
            assert!(
                matches!(bad.parse::<WalId>(), Err(BackupError::MalformedWalId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_single_segment_range() {
        for s in ["000000010000000000000000", "00000002000009D7000000FF", "0000000AFFFFFFFF00000003"] {
            let wal = id(s);
            assert_eq!(wal_range(wal, wal, DEFAULT_WAL_SEGMENT_MAX), vec![wal]);
        }
    }

    #[test]
    fn test_range_across_log_boundary() {
        let files = wal_range(
            id("00000001000009D6000000D0"),
            id("00000001000009D700000065"),
            DEFAULT_WAL_SEGMENT_MAX,
        );

        assert_eq!(files.len(), 150);
        assert!(files.iter().all(|f| f.to_string().starts_with("00000001")));
        assert_eq!(files[0].to_string(), "00000001000009D6000000D0");
        assert_eq!(files[47].to_string(), "00000001000009D6000000FF");
        assert_eq!(files[48].to_string(), "00000001000009D700000000");
        assert_eq!(files[149].to_string(), "00000001000009D700000065");
    }

    #[test]
    fn test_range_keeps_start_timeline() {
        let files = wal_range(
            id("0000000300000001000000FE"),
            id("000000040000000200000001"),
            DEFAULT_WAL_SEGMENT_MAX,
        );
        let names: Vec<String> = files.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec![
                "0000000300000001000000FE",
                "0000000300000001000000FF",
                "000000030000000200000000",
                "000000030000000200000001",
            ]
        );
    }

    #[test]
    fn test_end_before_start_yields_start_only() {
        let files = wal_range(
            id("000000010000000200000010"),
            id("000000010000000100000010"),
            DEFAULT_WAL_SEGMENT_MAX,
        );
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_wide_segment_max_does_not_wrap_early() {
        let files = wal_range(
            id("0000000100000001000000FE"),
            id("000000010000000100000101"),
            u32::MAX,
        );
        assert_eq!(files.len(), 4);
        assert_eq!(files[2].to_string(), "000000010000000100000100");
    }

    #[test]
    fn test_ranges_are_strictly_increasing() {
        let files = wal_range(
            id("0000000100000000000000F0"),
            id("000000010000000300000010"),
            DEFAULT_WAL_SEGMENT_MAX,
        );
        assert!(files.windows(2).all(|w| w[0].position() < w[1].position()));
    }
}
