//! Hash slot space and slot-range codec
//!
//! The cluster divides keys over a fixed space of 16384 hash slots. Persisted
//! topology stores slot ownership as compact range strings ("0-5461", "8000"),
//! while the in-memory working model uses expanded, sorted slot lists.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Total number of hash slots (same layout as Redis Cluster)
pub const TOTAL_SLOTS: u16 = 16384;

/// Slot-range string parse failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotRangeError {
    #[error("invalid slot number: {0}")]
    InvalidSlot(String),
    #[error("slot {0} out of range")]
    OutOfRange(u32),
    #[error("descending range: {0}")]
    Descending(String),
}

/// Contiguous slot range, start and end inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Number of slots covered; never zero, both ends are inclusive
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Encode a slot list into compact range strings.
///
/// The input need not be sorted; the output is sorted and minimal
/// ("0-99", "200", "300-301").
pub fn encode_ranges(slots: &[u16]) -> Vec<String> {
    let mut slots = slots.to_vec();
    slots.sort_unstable();
    slots.dedup();
    let mut result = Vec::new();
    let mut iter = slots.into_iter();
    let Some(first) = iter.next() else {
        return result;
    };
    let mut head = first;
    let mut prev = first;
    for slot in iter {
        if slot != prev + 1 {
            result.push(SlotRange { start: head, end: prev }.to_string());
            head = slot;
        }
        prev = slot;
    }
    result.push(SlotRange { start: head, end: prev }.to_string());
    result
}

/// Expand range strings back into a sorted slot list.
pub fn expand_ranges<S: AsRef<str>>(ranges: &[S]) -> Result<Vec<u16>, SlotRangeError> {
    let mut result = Vec::new();
    for range in ranges {
        let range = range.as_ref();
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (parse_slot(a)?, parse_slot(b)?),
            None => {
                let slot = parse_slot(range)?;
                (slot, slot)
            }
        };
        if start > end {
            return Err(SlotRangeError::Descending(range.to_string()));
        }
        result.extend(start..=end);
    }
    result.sort_unstable();
    result.dedup();
    Ok(result)
}

fn parse_slot(text: &str) -> Result<u16, SlotRangeError> {
    let value: u32 = text
        .trim()
        .parse()
        .map_err(|_| SlotRangeError::InvalidSlot(text.to_string()))?;
    if value >= TOTAL_SLOTS as u32 {
        return Err(SlotRangeError::OutOfRange(value));
    }
    Ok(value as u16)
}

/// Split the full slot space contiguously across `shards` masters.
///
/// Shard `i` receives `floor(16384 / shards)` slots, the first
/// `16384 % shards` shards one extra, so the whole space is covered with
/// no gaps. Returns one inclusive range per shard.
pub fn even_split(shards: usize) -> Vec<SlotRange> {
    assert!(shards > 0, "shard count must be positive");
    let base = TOTAL_SLOTS as usize / shards;
    let rem = TOTAL_SLOTS as usize % shards;
    let mut ranges = Vec::with_capacity(shards);
    let mut next = 0usize;
    for i in 0..shards {
        let len = base + usize::from(i < rem);
        ranges.push(SlotRange {
            start: next as u16,
            end: (next + len - 1) as u16,
        });
        next += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_merges_adjacent_slots() {
        let ranges = encode_ranges(&[5, 0, 1, 2, 3, 4, 100, 102, 103]);
        assert_eq!(ranges, vec!["0-5", "100", "102-103"]);
    }

    #[test]
    fn encode_empty_is_empty() {
        assert!(encode_ranges(&[]).is_empty());
    }

    #[test]
    fn expand_accepts_singles_and_ranges() {
        let slots = expand_ranges(&["0-3", "7", "10-11"]).unwrap();
        assert_eq!(slots, vec![0, 1, 2, 3, 7, 10, 11]);
    }

    #[test]
    fn expand_rejects_out_of_range() {
        assert_eq!(
            expand_ranges(&["16384"]),
            Err(SlotRangeError::OutOfRange(16384))
        );
        assert!(matches!(
            expand_ranges(&["12-3"]),
            Err(SlotRangeError::Descending(_))
        ));
    }

    #[test]
    fn codec_roundtrip_preserves_ownership() {
        let slots: Vec<u16> = (0..5461).chain(9000..9100).collect();
        let ranges = encode_ranges(&slots);
        assert_eq!(expand_ranges(&ranges).unwrap(), slots);
    }

    #[test]
    fn even_split_partitions_whole_space() {
        for shards in [1usize, 3, 5, 7, 16] {
            let ranges = even_split(shards);
            assert_eq!(ranges.len(), shards);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[shards - 1].end, TOTAL_SLOTS - 1);
            let total: usize = ranges.iter().map(|r| r.len()).sum();
            assert_eq!(total, TOTAL_SLOTS as usize);
            for pair in ranges.windows(2) {
                assert_eq!(pair[1].start, pair[0].end + 1);
            }
            // the remainder lands on the first shards
            let base = TOTAL_SLOTS as usize / shards;
            for (i, range) in ranges.iter().enumerate() {
                assert!(range.len() == base || range.len() == base + 1);
                if range.len() == base + 1 {
                    assert!(i < TOTAL_SLOTS as usize % shards);
                }
            }
        }
    }
}
