use std::cmp::Ordering;
use std::fmt;

use super::chromo::ChromoLookup;

/// Inclusive genomic interval `[start, stop]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenomicRange {
    pub start_chr: String,
    pub start_pos: u32,
    pub stop_chr: String,
    pub stop_pos: u32,
}

impl GenomicRange {
    pub fn new(
        start_chr: impl Into<String>,
        start_pos: u32,
        stop_chr: impl Into<String>,
        stop_pos: u32,
    ) -> Self {
        Self {
            start_chr: start_chr.into(),
            start_pos,
            stop_chr: stop_chr.into(),
            stop_pos,
        }
    }

    /// A range covering a single chromosome.
    pub fn chromosome(chr: &str) -> Self {
        Self::new(chr, 0, chr, u32::MAX)
    }

    pub fn contains(&self, lookup: &ChromoLookup, chr: &str, pos: u32) -> bool {
        !self.is_before_start(lookup, chr, pos) && !self.is_after_stop(lookup, chr, pos)
    }

    pub fn is_before_start(&self, lookup: &ChromoLookup, chr: &str, pos: u32) -> bool {
        lookup.compare(chr, pos, &self.start_chr, self.start_pos) == Ordering::Less
    }

    pub fn is_after_stop(&self, lookup: &ChromoLookup, chr: &str, pos: u32) -> bool {
        lookup.compare(chr, pos, &self.stop_chr, self.stop_pos) == Ordering::Greater
    }

    pub fn overlaps(&self, lookup: &ChromoLookup, other: &GenomicRange) -> bool {
        lookup.compare(
            &self.start_chr,
            self.start_pos,
            &other.stop_chr,
            other.stop_pos,
        ) != Ordering::Greater
            && lookup.compare(
                &other.start_chr,
                other.start_pos,
                &self.stop_chr,
                self.stop_pos,
            ) != Ordering::Greater
    }
}

impl fmt::Display for GenomicRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.start_chr, self.start_pos, self.stop_chr, self.stop_pos
        )
    }
}
