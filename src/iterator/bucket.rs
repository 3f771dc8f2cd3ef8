use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{BoxedIterator, FilterIterator, GenomicIterator, GorFileIterator, RowPredicate, SelectIterator};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, Header, Row, SourceRow};

/// Reads the rows of selected members from a shared bucket file.
///
/// Bucket rows carry their member's source name in the last column. When
/// `keep_source` is set that column is kept and the iterator reports the
/// source as already inserted, so a merge overwrites it with its own column
/// name. Otherwise the column is projected away.
pub struct BucketIterator {
    inner: BoxedIterator,
    path: PathBuf,
    name: String,
    keep_source: bool,
}

impl BucketIterator {
    pub fn open(
        path: impl AsRef<Path>,
        members: HashSet<String>,
        keep_source: bool,
        lookup: Arc<ChromoLookup>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = GorFileIterator::open(&path, lookup)?;
        let name = file.source_name().to_string();
        let width = file.header().len();
        if width < 3 {
            return Err(Error::InvalidRow {
                path,
                offset: 0,
                reason: "bucket header has no source column".to_string(),
            });
        }

        let predicate: RowPredicate =
            Arc::new(move |row: &Row| row.last_value().is_some_and(|source| members.contains(source)));
        let filtered = FilterIterator::new(file, predicate);

        let inner: BoxedIterator = if keep_source {
            Box::new(filtered)
        } else {
            let value_columns = (0..width - 3).collect();
            Box::new(SelectIterator::new(filtered, value_columns))
        };

        Ok(Self {
            inner,
            path,
            name,
            keep_source,
        })
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GenomicIterator for BucketIterator {
    fn header(&self) -> &Header {
        self.inner.header()
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn is_source_already_inserted(&self) -> bool {
        self.keep_source
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        self.inner.seek(chr, pos)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        self.inner.next_row()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        self.inner.pushdown_filter(predicate)
    }
}
