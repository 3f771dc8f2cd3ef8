//! The genomic iterator contract and its adapters.
//!
//! Every data source (a plain `.gor` file, a shared bucket, an in-memory row
//! set, or a merge of other sources) implements [`GenomicIterator`]. Extra
//! behaviour is layered on by wrapping: each adapter owns exactly one inner
//! iterator and is the only path through which that inner iterator is driven.
//!
//! ```text
//! MergeIterator
//!   ├── RangeIterator ── GorFileIterator      (entry with a range)
//!   ├── GorFileIterator                       (plain entry)
//!   └── BucketIterator ── SelectIterator ── FilterIterator ── GorFileIterator
//! ```
//!
//! # Push-down
//!
//! Sources may accept work the caller would otherwise do after retrieval.
//! The `pushdown_*` methods return `true` when the source took over the
//! operation; adapters fall back to doing it themselves otherwise, so
//! push-down is always an optimisation and never a requirement.

pub mod bucket;
pub mod file;
pub mod filter;
pub mod merge;
pub mod range;
pub mod retry;
pub mod rows;

use std::sync::Arc;

use crate::error::Result;
use crate::model::{Header, Row, SourceRow};

pub use bucket::BucketIterator;
pub use file::GorFileIterator;
pub use filter::{FilterIterator, SelectIterator, TopIterator};
pub use merge::{CancelFlag, MergeIterator, MergeOptions};
pub use range::RangeIterator;
pub use retry::{open_with_retry, BackoffRetry, NoRetry, RetryPolicy};
pub use rows::RowsIterator;

/// Row predicate used for filter push-down.
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

pub type BoxedIterator = Box<dyn GenomicIterator>;

pub trait GenomicIterator: Send {
    /// Column names; the first two are chromosome and position.
    fn header(&self) -> &Header;

    /// Name used for error messages and the inserted source column.
    fn source_name(&self) -> &str;

    /// True when rows already carry their own source column as the last
    /// column, so a merge should overwrite rather than append it.
    fn is_source_already_inserted(&self) -> bool {
        false
    }

    /// Positions at the first row with key >= (chr, pos). Returns whether a
    /// row is available.
    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool>;

    fn has_next(&mut self) -> Result<bool>;

    /// Returns the next row, or `Error::NoSuchElement` when none is left.
    fn next_row(&mut self) -> Result<SourceRow>;

    /// Releases the underlying resources. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn pushdown_filter(&mut self, _predicate: RowPredicate) -> bool {
        false
    }

    fn pushdown_select(&mut self, _columns: &[usize]) -> bool {
        false
    }

    fn pushdown_top(&mut self, _limit: u64) -> bool {
        false
    }
}

impl<T: GenomicIterator + ?Sized> GenomicIterator for Box<T> {
    fn header(&self) -> &Header {
        (**self).header()
    }

    fn source_name(&self) -> &str {
        (**self).source_name()
    }

    fn is_source_already_inserted(&self) -> bool {
        (**self).is_source_already_inserted()
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        (**self).seek(chr, pos)
    }

    fn has_next(&mut self) -> Result<bool> {
        (**self).has_next()
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        (**self).next_row()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        (**self).pushdown_filter(predicate)
    }

    fn pushdown_select(&mut self, columns: &[usize]) -> bool {
        (**self).pushdown_select(columns)
    }

    fn pushdown_top(&mut self, limit: u64) -> bool {
        (**self).pushdown_top(limit)
    }
}
