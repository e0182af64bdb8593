use serde::{Deserialize, Serialize};

/// Broker-assigned identifier for a stream entry.
///
/// Entry IDs are totally ordered: first by the millisecond timestamp at
/// which the entry was appended, then by a per-millisecond sequence number.
/// They render as `"<ms>-<seq>"`, the conventional stream-ID notation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId {
    /// Milliseconds since the Unix epoch at append time.
    pub ms: u64,
    /// Sequence number disambiguating entries appended in the same millisecond.
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible entry ID; use as the start of a full range scan.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    /// The largest possible entry ID; use as the end of a full range scan.
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// Creates an entry ID from its parts.
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Returns the ID a broker would assign to the next entry appended at
    /// `now_ms`, given the last ID it handed out.
    ///
    /// IDs are strictly increasing even if the clock stands still or runs
    /// backwards: the sequence number absorbs the difference.
    pub fn next_after(last: EntryId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').ok_or(ParseEntryIdError)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| ParseEntryIdError)?,
            seq: seq.parse().map_err(|_| ParseEntryIdError)?,
        })
    }
}

/// Error returned when parsing a malformed entry ID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseEntryIdError;

impl std::fmt::Display for ParseEntryIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry IDs must have the form \"<ms>-<seq>\"")
    }
}

impl std::error::Error for ParseEntryIdError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_ms_then_seq() {
        assert!(EntryId::new(1, 5) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 0) < EntryId::new(2, 1));
        assert!(EntryId::MIN < EntryId::new(0, 1));
        assert!(EntryId::new(u64::MAX, 0) < EntryId::MAX);
    }

    #[test]
    fn test_next_after_advances_with_clock() {
        let last = EntryId::new(100, 3);
        assert_eq!(EntryId::next_after(last, 200), EntryId::new(200, 0));
    }

    #[test]
    fn test_next_after_bumps_seq_when_clock_stalls() {
        let last = EntryId::new(100, 3);
        assert_eq!(EntryId::next_after(last, 100), EntryId::new(100, 4));
        // Clock moving backwards must not produce a smaller ID.
        assert_eq!(EntryId::next_after(last, 50), EntryId::new(100, 4));
    }

    #[test]
    fn test_display_and_parse_roundtrip() {
        let id = EntryId::new(1712345678901, 7);
        assert_eq!(id.to_string(), "1712345678901-7");
        assert_eq!("1712345678901-7".parse::<EntryId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-an-id".parse::<EntryId>().is_err());
        assert!("12345".parse::<EntryId>().is_err());
    }
}
