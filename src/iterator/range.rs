use std::sync::Arc;

use super::{GenomicIterator, RowPredicate};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, GenomicRange, Header, SourceRow};

/// Restricts an inner iterator to an inclusive genomic range.
///
/// The first access seeks the inner iterator to the range start. Iteration
/// ends at the first row past the range stop.
pub struct RangeIterator<I> {
    inner: I,
    range: GenomicRange,
    lookup: Arc<ChromoLookup>,
    positioned: bool,
    done: bool,
    pending: Option<SourceRow>,
}

impl<I: GenomicIterator> RangeIterator<I> {
    pub fn new(inner: I, range: GenomicRange, lookup: Arc<ChromoLookup>) -> Self {
        Self {
            inner,
            range,
            lookup,
            positioned: false,
            done: false,
            pending: None,
        }
    }

    pub fn range(&self) -> &GenomicRange {
        &self.range
    }

    pub fn into_inner(self) -> I {
        self.inner
    }

    fn position(&mut self) -> Result<()> {
        if !self.positioned {
            self.positioned = true;
            let (chr, pos) = (self.range.start_chr.clone(), self.range.start_pos);
            self.inner.seek(&chr, pos)?;
        }
        Ok(())
    }
}

impl<I: GenomicIterator> GenomicIterator for RangeIterator<I> {
    fn header(&self) -> &Header {
        self.inner.header()
    }

    fn source_name(&self) -> &str {
        self.inner.source_name()
    }

    fn is_source_already_inserted(&self) -> bool {
        self.inner.is_source_already_inserted()
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        self.positioned = true;
        self.pending = None;
        if self.range.is_after_stop(&self.lookup, chr, pos) {
            self.done = true;
            return Ok(false);
        }
        self.done = false;
        if self.range.is_before_start(&self.lookup, chr, pos) {
            let (start_chr, start_pos) = (self.range.start_chr.clone(), self.range.start_pos);
            self.inner.seek(&start_chr, start_pos)?;
        } else {
            self.inner.seek(chr, pos)?;
        }
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.done {
            return Ok(false);
        }
        self.position()?;
        if !self.inner.has_next()? {
            self.done = true;
            return Ok(false);
        }
        let row = self.inner.next_row()?;
        if self.range.is_after_stop(&self.lookup, row.chr(), row.pos()) {
            self.done = true;
            return Ok(false);
        }
        self.pending = Some(row);
        Ok(true)
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        self.pending.take().ok_or(Error::NoSuchElement)
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.done = true;
        self.inner.close()
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        self.inner.pushdown_filter(predicate)
    }

    fn pushdown_select(&mut self, columns: &[usize]) -> bool {
        self.inner.pushdown_select(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::RowsIterator;

    fn rows() -> RowsIterator {
        RowsIterator::from_lines(
            "r",
            "Chrom\tPos\tData",
            &[
                "chr1\t5\ta",
                "chr1\t10\tb",
                "chr2\t1\tc",
                "chr2\t20\td",
                "chr3\t7\te",
            ],
            ChromoLookup::shared(),
        )
        .unwrap()
    }

    fn drain<I: GenomicIterator>(it: &mut I) -> Vec<String> {
        let mut out = Vec::new();
        while it.has_next().unwrap() {
            out.push(it.next_row().unwrap().into_row().unwrap().to_string());
        }
        out
    }

    #[test]
    fn test_limits_to_range() {
        let range = GenomicRange::new("chr1", 10, "chr2", 20);
        let mut it = RangeIterator::new(rows(), range, ChromoLookup::shared());
        assert_eq!(drain(&mut it), vec!["chr1\t10\tb", "chr2\t1\tc", "chr2\t20\td"]);
    }

    #[test]
    fn test_seek_before_start_clamps() {
        let range = GenomicRange::new("chr2", 0, "chr3", 100);
        let mut it = RangeIterator::new(rows(), range, ChromoLookup::shared());
        assert!(it.seek("chr1", 1).unwrap());
        assert_eq!(it.next_row().unwrap().chr(), "chr2");
    }

    #[test]
    fn test_seek_past_stop_is_exhausted() {
        let range = GenomicRange::new("chr1", 0, "chr2", 5);
        let mut it = RangeIterator::new(rows(), range, ChromoLookup::shared());
        assert!(!it.seek("chr3", 1).unwrap());
        assert!(!it.has_next().unwrap());
        // A later seek back into range revives it.
        assert!(it.seek("chr2", 0).unwrap());
        assert_eq!(drain(&mut it), vec!["chr2\t1\tc"]);
    }
}
