use std::cmp::Ordering;
use std::sync::Arc;

use super::{GenomicIterator, RowPredicate};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, Header, Row, SourceRow};

/// Iterator over rows held in memory, sorted by (chromosome rank, position).
///
/// Used for programmatically registered sources and as a test double. It
/// honours filter, select and top push-down.
pub struct RowsIterator {
    name: String,
    header: Header,
    rows: Vec<Row>,
    lookup: Arc<ChromoLookup>,
    cursor: usize,
    filter: Option<RowPredicate>,
    select: Option<Vec<usize>>,
    limit: Option<u64>,
    emitted: u64,
    closed: bool,
}

impl RowsIterator {
    pub fn new(
        name: impl Into<String>,
        header: Header,
        rows: Vec<Row>,
        lookup: Arc<ChromoLookup>,
    ) -> Self {
        Self {
            name: name.into(),
            header,
            rows,
            lookup,
            cursor: 0,
            filter: None,
            select: None,
            limit: None,
            emitted: 0,
            closed: false,
        }
    }

    /// Builds the iterator from a header line and tab separated row lines.
    pub fn from_lines(
        name: impl Into<String>,
        header: &str,
        lines: &[&str],
        lookup: Arc<ChromoLookup>,
    ) -> Result<Self> {
        let name = name.into();
        let rows = lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                Row::parse(line).map_err(|reason| Error::InvalidRow {
                    path: name.clone().into(),
                    offset: idx as u64,
                    reason,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(name, Header::parse(header), rows, lookup))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::IteratorClosed);
        }
        Ok(())
    }

    fn skip_filtered(&mut self) {
        if let Some(filter) = &self.filter {
            while self.cursor < self.rows.len() && !filter(&self.rows[self.cursor]) {
                self.cursor += 1;
            }
        }
    }
}

impl GenomicIterator for RowsIterator {
    fn header(&self) -> &Header {
        &self.header
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        self.check_open()?;
        let lookup = &self.lookup;
        self.cursor = self
            .rows
            .partition_point(|row| lookup.compare(row.chr(), row.pos(), chr, pos) == Ordering::Less);
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(false);
        }
        self.skip_filtered();
        Ok(self.cursor < self.rows.len())
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        let row = self.rows[self.cursor].clone();
        self.cursor += 1;
        self.emitted += 1;
        let row = match &self.select {
            Some(columns) => row.select(columns),
            None => row,
        };
        Ok(SourceRow::Data(row))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        let combined: RowPredicate = match self.filter.take() {
            Some(existing) => Arc::new(move |row: &Row| existing(row) && predicate(row)),
            None => predicate,
        };
        self.filter = Some(combined);
        true
    }

    fn pushdown_select(&mut self, columns: &[usize]) -> bool {
        if self.select.is_some() {
            return false;
        }
        self.header = self.header.select(columns);
        self.select = Some(columns.to_vec());
        true
    }

    fn pushdown_top(&mut self, limit: u64) -> bool {
        self.limit = Some(self.limit.map_or(limit, |current| current.min(limit)));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> RowsIterator {
        RowsIterator::from_lines(
            "mem",
            "Chrom\tPos\tData",
            &["chr1\t1\ta", "chr1\t5\tb", "chr2\t3\tc", "chr10\t1\td"],
            ChromoLookup::shared(),
        )
        .unwrap()
    }

    fn drain(it: &mut RowsIterator) -> Vec<String> {
        let mut out = Vec::new();
        while it.has_next().unwrap() {
            out.push(it.next_row().unwrap().into_row().unwrap().to_string());
        }
        out
    }

    #[test]
    fn test_seek_uses_chromosome_rank() {
        let mut it = source();
        assert!(it.seek("chr2", 0).unwrap());
        assert_eq!(drain(&mut it), vec!["chr2\t3\tc", "chr10\t1\td"]);
        assert!(!it.seek("chrX", 1).unwrap());
    }

    #[test]
    fn test_next_without_rows_fails() {
        let mut it = source();
        drain(&mut it);
        assert!(matches!(it.next_row(), Err(Error::NoSuchElement)));
    }

    #[test]
    fn test_pushdowns() {
        let mut it = source();
        assert!(it.pushdown_filter(Arc::new(|row: &Row| row.value(0) != Some("b"))));
        assert!(it.pushdown_top(2));
        assert!(it.pushdown_select(&[]));
        assert_eq!(it.header().to_string(), "Chrom\tPos");
        assert_eq!(drain(&mut it), vec!["chr1\t1", "chr2\t3"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut it = source();
        it.close().unwrap();
        it.close().unwrap();
        assert!(matches!(it.has_next(), Err(Error::IteratorClosed)));
    }
}
