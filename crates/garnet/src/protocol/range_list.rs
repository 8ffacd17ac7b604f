//! Range-compressed sets of 24-bit sequence numbers, the payload of ACK
//! and NAK datagrams.

use garnet_binary::{BinaryError, BitReader, BitWriter, Result};

/// Refuse to materialize absurd ranges from the wire; a spread-out ack set
/// this wide would mean the remote is acknowledging datagrams we never
/// sent.
const MAX_RANGE_SPAN: u32 = 8192;
/// Upper bound on decoded range records per set.
const MAX_RANGES: usize = 4096;

/// A sorted list of closed `(min, max)` ranges with no overlaps and no
/// adjacent ranges left unmerged. On the wire a single-value range elides
/// `max` behind a one-bit flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<(u32, u32)>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, value: u32) -> bool {
        self.find(value).is_ok()
    }

    fn find(&self, value: u32) -> std::result::Result<usize, usize> {
        self.ranges.binary_search_by(|&(min, max)| {
            if value < min {
                std::cmp::Ordering::Greater
            } else if value > max {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    /// Inserts one value, merging with neighbouring ranges. The common case
    /// (monotonically increasing datagram numbers) appends or extends the
    /// final range in O(1).
    pub fn insert(&mut self, value: u32) {
        if let Some(last) = self.ranges.last_mut() {
            if value == last.1.wrapping_add(1) {
                last.1 = value;
                return;
            }
            if value > last.1 {
                self.ranges.push((value, value));
                return;
            }
        } else {
            self.ranges.push((value, value));
            return;
        }

        let idx = match self.find(value) {
            Ok(_) => return, // already present
            Err(idx) => idx,
        };
        let merges_prev = idx > 0 && self.ranges[idx - 1].1.wrapping_add(1) == value;
        let merges_next = idx < self.ranges.len() && value.wrapping_add(1) == self.ranges[idx].0;
        match (merges_prev, merges_next) {
            (true, true) => {
                self.ranges[idx - 1].1 = self.ranges[idx].1;
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx - 1].1 = value,
            (false, true) => self.ranges[idx].0 = value,
            (false, false) => self.ranges.insert(idx, (value, value)),
        }
    }

    /// Removes one value, splitting its range if it sits in the middle.
    pub fn remove(&mut self, value: u32) {
        let idx = match self.find(value) {
            Ok(idx) => idx,
            Err(_) => return,
        };
        let (min, max) = self.ranges[idx];
        match (value == min, value == max) {
            (true, true) => {
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx].0 = min + 1,
            (false, true) => self.ranges[idx].1 = max - 1,
            (false, false) => {
                self.ranges[idx].1 = value - 1;
                self.ranges.insert(idx + 1, (value + 1, max));
            }
        }
    }

    /// Iterates every contained value in ascending order.
    pub fn iter_values(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(min, max)| min..=max)
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Encoded size in bits of a single range record.
    fn record_bits(min: u32, max: u32) -> usize {
        if min == max { 1 + 24 } else { 1 + 48 }
    }

    /// Serializes as many leading ranges as fit within `max_bytes`, removes
    /// them from the list, and returns how many were written. Callers keep
    /// the remainder pending for the next ACK/NAK datagram.
    pub fn serialize_and_drain(&mut self, writer: &mut BitWriter, max_bytes: usize) -> usize {
        let budget_bits = (max_bytes * 8).saturating_sub(16);
        let mut used_bits = 0usize;
        let mut fit = 0usize;
        for &(min, max) in &self.ranges {
            let bits = Self::record_bits(min, max);
            if used_bits + bits > budget_bits || fit == u16::MAX as usize {
                break;
            }
            used_bits += bits;
            fit += 1;
        }

        writer.write_u16_be(fit as u16);
        for &(min, max) in self.ranges.iter().take(fit) {
            writer.write_bit(min == max);
            writer.write_u24_le(min);
            if min != max {
                writer.write_u24_le(max);
            }
        }
        self.ranges.drain(..fit);
        fit
    }

    pub fn deserialize(reader: &mut BitReader) -> Result<RangeList> {
        let count = reader.read_u16_be()? as usize;
        if count > MAX_RANGES {
            return Err(BinaryError::InvalidData(format!(
                "range list declares {} records",
                count
            )));
        }
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            let single = reader.read_bit()?;
            let min = reader.read_u24_le()?;
            let max = if single { min } else { reader.read_u24_le()? };
            if max < min {
                return Err(BinaryError::InvalidData(format!(
                    "inverted range {}..{}",
                    min, max
                )));
            }
            if max - min > MAX_RANGE_SPAN {
                return Err(BinaryError::InvalidData(format!(
                    "range {}..{} wider than {}",
                    min, max, MAX_RANGE_SPAN
                )));
            }
            ranges.push((min, max));
        }
        Ok(RangeList { ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[u32]) -> RangeList {
        let mut l = RangeList::new();
        for &v in values {
            l.insert(v);
        }
        l
    }

    #[test]
    fn insert_merges_adjacent_values() {
        assert_eq!(list(&[1, 2, 3]).ranges(), &[(1, 3)]);
        assert_eq!(list(&[3, 1, 2]).ranges(), &[(1, 3)]);
        assert_eq!(list(&[5, 7, 9]).ranges(), &[(5, 5), (7, 7), (9, 9)]);
        assert_eq!(list(&[1, 2, 4, 5, 3]).ranges(), &[(1, 5)]);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut l = list(&[1, 2, 3]);
        l.insert(2);
        assert_eq!(l.ranges(), &[(1, 3)]);
    }

    #[test]
    fn remove_splits_ranges() {
        let mut l = list(&[1, 2, 3, 4, 5]);
        l.remove(3);
        assert_eq!(l.ranges(), &[(1, 2), (4, 5)]);
        l.remove(1);
        assert_eq!(l.ranges(), &[(2, 2), (4, 5)]);
        l.remove(2);
        assert_eq!(l.ranges(), &[(4, 5)]);
        l.remove(9);
        assert_eq!(l.ranges(), &[(4, 5)]);
    }

    #[test]
    fn serialize_round_trips() {
        let mut l = list(&[10, 15, 16, 17, 18, 20]);
        let expected = l.clone();
        let mut w = BitWriter::new();
        let written = l.serialize_and_drain(&mut w, 1400);
        assert_eq!(written, 3);
        assert!(l.is_empty());

        let mut r = BitReader::new(w.into_bytes());
        let decoded = RangeList::deserialize(&mut r).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn single_value_ranges_elide_max() {
        let mut singles = list(&[1, 3, 5, 7]);
        let mut w = BitWriter::new();
        singles.serialize_and_drain(&mut w, 1400);
        // 2 bytes count + 4 * (1 bit + 24 bits) = 2 + ceil(100 / 8)
        assert_eq!(w.byte_len(), 2 + 13);
    }

    #[test]
    fn serialize_respects_the_byte_budget() {
        let mut l = list(&[1, 3, 5, 7, 9, 11, 13, 15]);
        let mut w = BitWriter::new();
        // Budget: 2 bytes count + 2 single records (25 bits each).
        let written = l.serialize_and_drain(&mut w, 2 + 7);
        assert_eq!(written, 2);
        assert_eq!(l.range_count(), 6);

        let mut r = BitReader::new(w.into_bytes());
        let decoded = RangeList::deserialize(&mut r).unwrap();
        assert_eq!(decoded.ranges(), &[(1, 1), (3, 3)]);
    }

    #[test]
    fn deserialize_rejects_inverted_and_oversized_ranges() {
        let mut w = BitWriter::new();
        w.write_u16_be(1);
        w.write_bit(false);
        w.write_u24_le(10);
        w.write_u24_le(4);
        let mut r = BitReader::new(w.into_bytes());
        assert!(RangeList::deserialize(&mut r).is_err());

        let mut w = BitWriter::new();
        w.write_u16_be(1);
        w.write_bit(false);
        w.write_u24_le(0);
        w.write_u24_le(MAX_RANGE_SPAN + 1);
        let mut r = BitReader::new(w.into_bytes());
        assert!(RangeList::deserialize(&mut r).is_err());
    }

    #[test]
    fn iter_values_walks_every_member() {
        let l = list(&[4, 5, 6, 9]);
        let values: Vec<u32> = l.iter_values().collect();
        assert_eq!(values, vec![4, 5, 6, 9]);
    }
}
