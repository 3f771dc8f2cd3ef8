use std::path::{Path, PathBuf};

use super::entry::{resolve, DictionaryEntry};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, GenomicRange};

/// Criteria for selecting dictionary entries.
///
/// Every criterion that is set must match; an empty filter selects all
/// entries. Several filters are combined as a union by
/// [`DictionaryTable::select_union`](super::DictionaryTable::select_union).
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    tags: Option<Vec<String>>,
    files: Option<Vec<PathBuf>>,
    buckets: Option<Vec<PathBuf>>,
    range: Option<GenomicRange>,
}

impl TableFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries whose alias, tag or source name is one of `tags`.
    pub fn tags<I, S>(mut self, tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(Error::EmptyTag);
        }
        self.tags = Some(tags);
        Ok(self)
    }

    /// Parses a comma separated tag list such as `pn1,pn2`.
    pub fn tag_list(self, list: &str) -> Result<Self> {
        self.tags(list.split(',').map(str::trim))
    }

    /// Entries whose content file is one of `files`, relative paths taken
    /// against the table directory.
    pub fn files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn buckets<I, P>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.buckets = Some(buckets.into_iter().map(Into::into).collect());
        self
    }

    /// Entries that may hold rows inside `range`. Entries without a range
    /// always qualify.
    pub fn range(mut self, range: GenomicRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.files.is_none() && self.buckets.is_none() && self.range.is_none()
    }

    pub fn matches(&self, entry: &DictionaryEntry, root: &Path, lookup: &ChromoLookup) -> bool {
        if let Some(tags) = &self.tags {
            let name = entry.source_name();
            let hit = tags.iter().any(|tag| {
                *tag == name
                    || entry.tag.as_deref() == Some(tag.as_str())
                    || entry.alias.as_deref() == Some(tag.as_str())
            });
            if !hit {
                return false;
            }
        }
        if let Some(files) = &self.files {
            if !files.iter().any(|file| resolve(root, file) == entry.path) {
                return false;
            }
        }
        if let Some(buckets) = &self.buckets {
            let hit = entry
                .bucket
                .as_ref()
                .is_some_and(|bucket| buckets.iter().any(|b| resolve(root, b) == *bucket));
            if !hit {
                return false;
            }
        }
        if let (Some(range), Some(entry_range)) = (&self.range, &entry.range) {
            if !range.overlaps(lookup, entry_range) {
                return false;
            }
        }
        true
    }
}
