//! K-way merge of genomic sources.
//!
//! Each source contributes at most one cursor to a binary heap ordered by
//! (chromosome rank, position, source index). Popping the heap yields the
//! globally smallest row; the source it came from is then refilled.
//!
//! ```text
//!   source 0: chr1:5  chr1:9 ...      heap (min first)
//!   source 1: chr1:2  chr2:1 ...  ->  [chr1:2 #1, chr1:5 #0, chr3:4 #2]
//!   source 2: chr3:4  ...
//! ```
//!
//! Progress rows from slow sources occupy a heap slot like data rows but are
//! discarded when they reach the head.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::warn;

use super::{BoxedIterator, GenomicIterator, RowPredicate};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, Header, RankedKey, Row, SourceRow, DEFAULT_SOURCE_COLUMN};

/// Shared cancellation signal, polled by the merge while priming.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Tag every row with its source name.
    pub insert_source: bool,
    pub source_column: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            insert_source: false,
            source_column: DEFAULT_SOURCE_COLUMN.to_string(),
        }
    }
}

impl MergeOptions {
    pub fn insert_source(mut self, insert_source: bool) -> Self {
        self.insert_source = insert_source;
        self
    }

    pub fn source_column(mut self, name: impl Into<String>) -> Self {
        self.source_column = name.into();
        self
    }
}

struct Cursor {
    key: RankedKey,
    source: usize,
    row: SourceRow,
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; reverse so the smallest key pops first.
impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unprimed,
    Primed,
    Closed,
}

pub struct MergeIterator {
    sources: Vec<BoxedIterator>,
    names: Vec<String>,
    // Sources whose rows already carry their source column.
    inserted: Vec<bool>,
    // Filters for sources that refused push-down.
    local_filters: Vec<Option<RowPredicate>>,
    header: Header,
    heap: BinaryHeap<Cursor>,
    state: State,
    options: MergeOptions,
    lookup: Arc<ChromoLookup>,
    cancel: Option<CancelFlag>,
    cancelled: bool,
    name: String,
}

impl MergeIterator {
    /// Validates that all sources share one effective header and builds the
    /// merge. On mismatch every source is closed before the error returns.
    pub fn new(
        mut sources: Vec<BoxedIterator>,
        options: MergeOptions,
        lookup: Arc<ChromoLookup>,
        cancel: Option<CancelFlag>,
    ) -> Result<Self> {
        let effective = |source: &BoxedIterator| {
            if options.insert_source {
                source
                    .header()
                    .with_source_column(&options.source_column, source.is_source_already_inserted())
            } else {
                source.header().clone()
            }
        };

        let header = sources.first().map(&effective).unwrap_or_default();
        let mismatch = sources.iter().skip(1).find_map(|source| {
            let found = effective(source);
            (!found.matches(&header)).then(|| Error::HeaderMismatch {
                first_name: sources[0].source_name().to_string(),
                expected: header.describe(),
                source_name: source.source_name().to_string(),
                found: found.describe(),
            })
        });
        if let Some(err) = mismatch {
            let _ = close_all(&mut sources);
            return Err(err);
        }

        let names = sources
            .iter()
            .map(|source| source.source_name().to_string())
            .collect();
        let inserted = sources
            .iter()
            .map(|source| source.is_source_already_inserted())
            .collect();
        let local_filters = vec![None; sources.len()];

        Ok(Self {
            sources,
            names,
            inserted,
            local_filters,
            header,
            heap: BinaryHeap::new(),
            state: State::Unprimed,
            options,
            lookup,
            cancel,
            cancelled: false,
            name: "merge".to_string(),
        })
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    fn check_cancel(&mut self) -> bool {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            self.cancelled = true;
        }
        self.cancelled
    }

    /// Pulls the next acceptable row of `source` into the heap.
    fn refill(&mut self, source: usize) -> Result<()> {
        let iter = &mut self.sources[source];
        while iter.has_next()? {
            let row = iter.next_row()?;
            if let (SourceRow::Data(data), Some(filter)) = (&row, &self.local_filters[source]) {
                if !filter(data) {
                    continue;
                }
            }
            self.heap.push(Cursor {
                key: self.lookup.key(row.chr(), row.pos()),
                source,
                row,
            });
            break;
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        self.heap.clear();
        self.state = State::Primed;
        for source in 0..self.sources.len() {
            if self.check_cancel() {
                break;
            }
            self.refill(source)?;
        }
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<()> {
        match self.state {
            State::Closed => Err(Error::IteratorClosed),
            State::Unprimed => self.prime(),
            State::Primed => Ok(()),
        }
    }

    fn tag(&self, mut row: Row, source: usize) -> Row {
        if self.options.insert_source && !self.inserted[source] {
            let name = &self.names[source];
            if row.num_cols() == self.header.len() {
                row.set_last_value(name.as_str());
            } else {
                row.push_value(name.as_str());
            }
        }
        row
    }

    /// Returns the next data row with the source column applied.
    pub fn next_data(&mut self) -> Result<Row> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        let cursor = self.heap.pop().ok_or(Error::NoSuchElement)?;
        if let Err(err) = self.refill(cursor.source) {
            // The popped row stays at the head for the next call.
            self.heap.push(cursor);
            return Err(err);
        }
        match cursor.row {
            SourceRow::Data(row) => Ok(self.tag(row, cursor.source)),
            SourceRow::Progress { .. } => Err(Error::InvalidState(
                "progress row at merge head".to_string(),
            )),
        }
    }
}

fn close_all(sources: &mut [BoxedIterator]) -> Result<()> {
    let mut first_err = None;
    for source in sources.iter_mut() {
        if let Err(err) = source.close() {
            warn!(source = source.source_name(), error = %err, "failed to close source");
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

impl GenomicIterator for MergeIterator {
    fn header(&self) -> &Header {
        &self.header
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn is_source_already_inserted(&self) -> bool {
        self.options.insert_source
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        if self.state == State::Closed {
            return Err(Error::IteratorClosed);
        }
        self.heap.clear();
        for source in self.sources.iter_mut() {
            source.seek(chr, pos)?;
        }
        self.prime()?;
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        loop {
            if self.cancelled {
                return Ok(false);
            }
            let source = match self.heap.peek() {
                None => return Ok(false),
                Some(cursor) if !cursor.row.is_progress() => return Ok(true),
                Some(cursor) => cursor.source,
            };
            self.heap.pop();
            if self.check_cancel() {
                return Ok(false);
            }
            self.refill(source)?;
        }
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        self.next_data().map(SourceRow::Data)
    }

    fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;
        self.heap.clear();
        close_all(&mut self.sources)
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        for (source, filter) in self.sources.iter_mut().zip(self.local_filters.iter_mut()) {
            if !source.pushdown_filter(predicate.clone()) {
                *filter = Some(match filter.take() {
                    Some(existing) => {
                        let predicate = predicate.clone();
                        Arc::new(move |row: &Row| existing(row) && predicate(row))
                    }
                    None => predicate.clone(),
                });
            }
        }
        true
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(self.next_data()),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for MergeIterator {
    fn drop(&mut self) {
        if self.state != State::Closed {
            let _ = self.close();
        }
    }
}
