use std::cmp::max;
use std::collections::BTreeMap;
use std::ops::Range;

/// A set of `u64` values, stored as disjoint, non-adjacent half-open ranges. This is used both
///  for received packet numbers (to assemble ACK frames) and for acknowledged stream offsets.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RangeSet {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        Default::default()
    }

    /// Returns true if at least one value was not in the set before
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return false;
        }

        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= end {
                return false;
            }
            if prev_end >= start {
                start = prev_start;
                end = max(end, prev_end);
                self.ranges.remove(&prev_start);
            }
        }

        while let Some((&next_start, &next_end)) = self.ranges.range(start..).next() {
            if next_start > end {
                break;
            }
            end = max(end, next_end);
            self.ranges.remove(&next_start);
        }

        self.ranges.insert(start, end);
        true
    }

    pub fn insert_one(&mut self, value: u64) -> bool {
        self.insert(value..value + 1)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges.range(..=value).next_back()
            .map(|(_, &end)| value < end)
            .unwrap_or(false)
    }

    /// The end of the contiguous run of values starting at `base`, or `base` itself if `base` is
    ///  not in the set
    pub fn contiguous_end(&self, base: u64) -> u64 {
        match self.ranges.range(..=base).next_back() {
            Some((_, &end)) if end > base => end,
            _ => base,
        }
    }

    pub fn max(&self) -> Option<u64> {
        self.ranges.last_key_value()
            .map(|(_, &end)| end - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// the ranges, highest first
    pub fn iter_desc(&self) -> impl Iterator<Item=Range<u64>> + '_ {
        self.ranges.iter()
            .rev()
            .map(|(&start, &end)| start..end)
    }

    /// Forget everything below `threshold` - there is no point in tracking ancient packet numbers
    pub fn remove_below(&mut self, threshold: u64) {
        let to_remove: Vec<u64> = self.ranges.range(..threshold)
            .map(|(&start, _)| start)
            .collect();

        for start in to_remove {
            if let Some(end) = self.ranges.remove(&start) {
                if end > threshold {
                    self.ranges.insert(threshold, end);
                }
            }
        }
    }
}
