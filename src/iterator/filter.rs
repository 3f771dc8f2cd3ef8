use super::{GenomicIterator, RowPredicate};
use crate::error::{Error, Result};
use crate::model::{Header, SourceRow};

/// Keeps only rows matching a predicate. Progress rows pass through.
pub struct FilterIterator<I> {
    inner: I,
    // None once the inner iterator accepted the predicate.
    predicate: Option<RowPredicate>,
    pending: Option<SourceRow>,
}

impl<I: GenomicIterator> FilterIterator<I> {
    pub fn new(mut inner: I, predicate: RowPredicate) -> Self {
        let predicate = if inner.pushdown_filter(predicate.clone()) {
            None
        } else {
            Some(predicate)
        };
        Self {
            inner,
            predicate,
            pending: None,
        }
    }

    fn accepts(&self, row: &SourceRow) -> bool {
        match (row, &self.predicate) {
            (SourceRow::Data(data), Some(predicate)) => predicate(data),
            _ => true,
        }
    }
}

impl<I: GenomicIterator> GenomicIterator for FilterIterator<I> {
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
        self.pending = None;
        self.inner.seek(chr, pos)?;
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        while self.inner.has_next()? {
            let row = self.inner.next_row()?;
            if self.accepts(&row) {
                self.pending = Some(row);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        self.pending.take().ok_or(Error::NoSuchElement)
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.inner.close()
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        self.inner.pushdown_filter(predicate)
    }

    fn pushdown_top(&mut self, limit: u64) -> bool {
        // A limit below a local filter would count rows the filter drops.
        self.predicate.is_none() && self.inner.pushdown_top(limit)
    }
}

/// Projects rows onto a subset of value columns.
pub struct SelectIterator<I> {
    inner: I,
    header: Header,
    // None once the inner iterator accepted the projection.
    columns: Option<Vec<usize>>,
}

impl<I: GenomicIterator> SelectIterator<I> {
    /// `columns` are value column indices, 0 being the first column after
    /// the position.
    pub fn new(mut inner: I, columns: Vec<usize>) -> Self {
        let header = inner.header().select(&columns);
        let columns = if inner.pushdown_select(&columns) {
            None
        } else {
            Some(columns)
        };
        Self {
            inner,
            header,
            columns,
        }
    }
}

impl<I: GenomicIterator> GenomicIterator for SelectIterator<I> {
    fn header(&self) -> &Header {
        &self.header
    }

    fn source_name(&self) -> &str {
        self.inner.source_name()
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        self.inner.seek(chr, pos)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        let row = self.inner.next_row()?;
        Ok(match (row, &self.columns) {
            (SourceRow::Data(data), Some(columns)) => SourceRow::Data(data.select(columns)),
            (row, _) => row,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn pushdown_top(&mut self, limit: u64) -> bool {
        self.inner.pushdown_top(limit)
    }
}

/// Stops after a fixed number of data rows.
pub struct TopIterator<I> {
    inner: I,
    // None once the inner iterator accepted the limit.
    limit: Option<u64>,
    emitted: u64,
}

impl<I: GenomicIterator> TopIterator<I> {
    pub fn new(mut inner: I, limit: u64) -> Self {
        let limit = if inner.pushdown_top(limit) {
            None
        } else {
            Some(limit)
        };
        Self {
            inner,
            limit,
            emitted: 0,
        }
    }
}

impl<I: GenomicIterator> GenomicIterator for TopIterator<I> {
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
        self.inner.seek(chr, pos)?;
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(false);
        }
        self.inner.has_next()
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        let row = self.inner.next_row()?;
        if !row.is_progress() {
            self.emitted += 1;
        }
        Ok(row)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
