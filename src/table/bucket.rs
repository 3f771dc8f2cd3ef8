//! Packs dictionary entries into shared bucket files.
//!
//! A run holds the table's `bucketize` write lock throughout:
//!
//! ```text
//! lock ─> reload table ─> plan groups ─┬─> merge members ─> .tmp ─> fsync ─> rename ─> save table
//!                                      └─> (next group, lock renewed) ...
//! ```
//!
//! Every bucket is persisted in the table right after its file is in place,
//! so a failure part way through keeps the buckets already written and leaves
//! the failed group's entries unassigned. Existing bucket files are never
//! modified; repacking writes new ones and old files become orphans that
//! [`BucketManager::delete_orphan_buckets`] removes once they are old enough.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use tracing::{debug, info, warn};

use super::dictionary::DictionaryTable;
use super::entry::{resolve, DictionaryEntry};
use super::lock::{TableLock, TableLocks};
use crate::config::{BucketConfig, LockConfig};
use crate::error::{Error, Result};
use crate::iterator::file::GorFileWriter;
use crate::iterator::{BoxedIterator, GenomicIterator, MergeIterator, MergeOptions};
use crate::model::ChromoLookup;
use crate::query::{close_opened, open_bucket_member, open_entry_file};

pub use crate::config::PackLevel;

/// Write lock held while a table is bucketized.
pub const BUCKETIZE_LOCK: &str = "bucketize";

pub struct BucketManager {
    config: BucketConfig,
    lock_config: LockConfig,
    lookup: Arc<ChromoLookup>,
}

impl BucketManager {
    pub fn new(config: BucketConfig, lock_config: LockConfig, lookup: Arc<ChromoLookup>) -> Self {
        Self {
            config,
            lock_config,
            lookup,
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Packs entries of the table at `table_path` into new buckets and
    /// returns the number of buckets created. `max_new_buckets` of 0 means
    /// no limit.
    pub fn bucketize(
        &self,
        table_path: impl AsRef<Path>,
        pack_level: PackLevel,
        max_new_buckets: usize,
    ) -> Result<usize> {
        let table_path = table_path.as_ref();
        let locks = TableLocks::new(table_path, self.lock_config.clone());
        let mut lock = locks.acquire_write(BUCKETIZE_LOCK, self.lock_config.timeout)?;

        let mut table = DictionaryTable::load(table_path)?;
        let groups = self.plan(&table, pack_level, max_new_buckets);
        if groups.is_empty() {
            debug!(table = %table_path.display(), ?pack_level, "nothing to bucketize");
            lock.release()?;
            return Ok(0);
        }

        let mut created = 0;
        for group in &groups {
            lock.renew()?;
            let dir = self.next_bucket_dir(&table);
            let (bucket, rows) = self.write_bucket(&table, group, &dir)?;
            persist_bucket(&mut lock, &mut table, group, &bucket)?;
            created += 1;
            info!(
                table = %table_path.display(),
                bucket = %bucket.display(),
                entries = group.len(),
                rows,
                "created bucket"
            );
        }

        lock.release()?;
        Ok(created)
    }

    /// Entries that have not been assigned a bucket.
    pub fn needs_bucketizing(&self, table_path: impl AsRef<Path>) -> Result<Vec<DictionaryEntry>> {
        let table = DictionaryTable::load(table_path.as_ref())?;
        Ok(table
            .entries()
            .iter()
            .filter(|entry| !entry.is_bucketed())
            .cloned()
            .collect())
    }

    /// Removes bucket files of this table that no entry references and that
    /// were last modified at least `min_age` ago. Returns the removed paths.
    pub fn delete_orphan_buckets(
        &self,
        table_path: impl AsRef<Path>,
        min_age: Duration,
    ) -> Result<Vec<PathBuf>> {
        let table_path = table_path.as_ref();
        let locks = TableLocks::new(table_path, self.lock_config.clone());
        let lock = locks.acquire_write(BUCKETIZE_LOCK, self.lock_config.timeout)?;

        let table = DictionaryTable::load(table_path)?;
        let referenced: HashSet<&PathBuf> = table
            .entries()
            .iter()
            .filter_map(|entry| entry.bucket.as_ref())
            .collect();
        let prefix = bucket_prefix(&table);
        let now = SystemTime::now();

        let mut removed = Vec::new();
        for dir in self.bucket_dirs(&table) {
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::source_io(&dir, e)),
            };
            for item in listing {
                let item = item.map_err(|e| Error::source_io(&dir, e))?;
                let name = item.file_name().to_string_lossy().into_owned();
                if !name.starts_with(&prefix) || !name.ends_with(".gor") {
                    continue;
                }
                let path = dir.join(&name);
                if referenced.contains(&path) {
                    continue;
                }
                let modified = item
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map_err(|e| Error::source_io(&path, e))?;
                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < min_age {
                    continue;
                }
                fs::remove_file(&path).map_err(|e| Error::source_io(&path, e))?;
                info!(table = %table_path.display(), bucket = %path.display(), ?age, "deleted orphan bucket");
                removed.push(path);
            }
        }

        lock.release()?;
        Ok(removed)
    }

    /// Groups of entry indices, one per bucket to write.
    fn plan(&self, table: &DictionaryTable, pack_level: PackLevel, max_new_buckets: usize) -> Vec<Vec<usize>> {
        let entries = table.entries();
        let size = self.config.bucket_size;

        let unbucketed: Vec<usize> = (0..entries.len())
            .filter(|&idx| !entries[idx].is_bucketed())
            .collect();
        let underfull: Vec<Vec<usize>> = (0..entries.len())
            .filter_map(|idx| entries[idx].bucket.as_ref().map(|bucket| (bucket, idx)))
            .into_group_map()
            .into_values()
            .filter(|members| members.len() < size)
            .sorted_by_key(|members| members[0])
            .collect();

        let mut groups = match pack_level {
            PackLevel::NoPacking => pack(entries, unbucketed, size),
            PackLevel::Consolidate => {
                let mut pending = unbucketed;
                let mut groups = Vec::new();
                for members in underfull {
                    let existing = members.len();
                    let mut names: HashSet<String> =
                        members.iter().map(|&idx| entries[idx].source_name()).collect();
                    let mut group = members;
                    pending.retain(|&idx| {
                        if group.len() >= size || !names.insert(entries[idx].source_name()) {
                            return true;
                        }
                        group.push(idx);
                        false
                    });
                    if group.len() > existing {
                        groups.push(group);
                    }
                }
                groups.extend(pack(entries, pending, size));
                groups
            }
            PackLevel::Full => {
                let pool: Vec<usize> = unbucketed
                    .into_iter()
                    .chain(underfull.into_iter().flatten())
                    .sorted()
                    .collect();
                pack(entries, pool, size)
                    .into_iter()
                    .filter(|group| !is_existing_bucket(table, group))
                    .collect()
            }
        };

        if pack_level != PackLevel::Full {
            groups.retain(|group| group.len() >= self.config.min_bucket_size);
        }
        if max_new_buckets > 0 {
            groups.truncate(max_new_buckets);
        }
        groups
    }

    fn bucket_dirs(&self, table: &DictionaryTable) -> Vec<PathBuf> {
        self.config
            .bucket_dirs
            .iter()
            .map(|dir| resolve(table.root(), dir))
            .collect()
    }

    /// Round-robin over the configured directories, advancing with every
    /// save of the table.
    fn next_bucket_dir(&self, table: &DictionaryTable) -> PathBuf {
        let dirs = self.bucket_dirs(table);
        let idx = (table.serial() % dirs.len().max(1) as u64) as usize;
        dirs.into_iter()
            .nth(idx)
            .unwrap_or_else(|| table.root().to_path_buf())
    }

    /// Merges the group's rows into a new bucket file in `dir`. Returns its
    /// path and row count.
    fn write_bucket(&self, table: &DictionaryTable, group: &[usize], dir: &Path) -> Result<(PathBuf, u64)> {
        fs::create_dir_all(dir).map_err(|e| Error::source_io(dir, e))?;
        let bucket = unique_bucket_path(table, dir);
        let file_name = bucket
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.tmp", file_name));

        let mut merge = self.open_group(table, group)?;
        let _ = fs::remove_file(&tmp);
        let written = write_rows(&mut merge, &tmp);
        if let Err(err) = merge.close() {
            warn!(bucket = %bucket.display(), error = %err, "failed to close bucket sources");
        }

        let rows = match written.and_then(|rows| {
            fs::rename(&tmp, &bucket).map_err(|e| Error::source_io(&bucket, e))?;
            Ok(rows)
        }) {
            Ok(rows) => rows,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                warn!(
                    table = %table.path().display(),
                    bucket = %bucket.display(),
                    entries = group.len(),
                    error = %err,
                    "bucket write failed"
                );
                return Err(err);
            }
        };
        Ok((bucket, rows))
    }

    fn open_group(&self, table: &DictionaryTable, group: &[usize]) -> Result<MergeIterator> {
        let mut sources: Vec<BoxedIterator> = Vec::with_capacity(group.len());
        for &idx in group {
            let entry = &table.entries()[idx];
            let opened = if entry.is_bucketed() {
                open_bucket_member(entry, true, &self.lookup)
            } else {
                open_entry_file(entry, &self.lookup)
            };
            match opened {
                Ok(source) => sources.push(source),
                Err(err) => {
                    close_opened(&mut sources);
                    return Err(err);
                }
            }
        }
        MergeIterator::new(
            sources,
            MergeOptions::default().insert_source(true),
            self.lookup.clone(),
            None,
        )
    }
}

/// Assigns `group` to the freshly written `bucket` and saves the table. The
/// lock is renewed first; if it was lost, or the save fails, the bucket file
/// is removed and the table on disk is left as it was.
fn persist_bucket(
    lock: &mut TableLock,
    table: &mut DictionaryTable,
    group: &[usize],
    bucket: &Path,
) -> Result<()> {
    let saved = lock.renew().and_then(|()| {
        let previous: Vec<Option<PathBuf>> = group
            .iter()
            .map(|&idx| table.entries()[idx].bucket.clone())
            .collect();
        for &idx in group {
            table.entries_mut()[idx].bucket = Some(bucket.to_path_buf());
        }
        table.save().inspect_err(|_| {
            for (&idx, prev) in group.iter().zip(previous) {
                table.entries_mut()[idx].bucket = prev;
            }
        })
    });
    if let Err(err) = saved {
        let _ = fs::remove_file(bucket);
        warn!(
            table = %table.path().display(),
            bucket = %bucket.display(),
            error = %err,
            "discarded bucket, table not updated"
        );
        return Err(err);
    }
    Ok(())
}

fn write_rows(merge: &mut MergeIterator, tmp: &Path) -> Result<u64> {
    let mut writer = GorFileWriter::create(tmp, merge.header())?;
    for row in merge.by_ref() {
        writer.write_row(&row?)?;
    }
    writer.finish()
}

/// First-fit packing into groups of at most `size` entries with distinct
/// source names, keeping dictionary order inside each group.
fn pack(entries: &[DictionaryEntry], indices: Vec<usize>, size: usize) -> Vec<Vec<usize>> {
    let mut groups: Vec<(Vec<usize>, HashSet<String>)> = Vec::new();
    for idx in indices {
        let name = entries[idx].source_name();
        match groups
            .iter_mut()
            .find(|(group, names)| group.len() < size && !names.contains(&name))
        {
            Some((group, names)) => {
                group.push(idx);
                names.insert(name);
            }
            None => groups.push((vec![idx], HashSet::from([name]))),
        }
    }
    groups.into_iter().map(|(group, _)| group).collect()
}

/// True when `group` is exactly the membership of one existing bucket.
fn is_existing_bucket(table: &DictionaryTable, group: &[usize]) -> bool {
    let entries = table.entries();
    let Some(bucket) = entries[group[0]].bucket.as_ref() else {
        return false;
    };
    let members = entries
        .iter()
        .filter(|entry| entry.bucket.as_ref() == Some(bucket))
        .count();
    members == group.len()
        && group
            .iter()
            .all(|&idx| entries[idx].bucket.as_ref() == Some(bucket))
}

fn bucket_prefix(table: &DictionaryTable) -> String {
    let stem = table
        .path()
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    format!("bucket_{}_", stem)
}

fn unique_bucket_path(table: &DictionaryTable, dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let base = format!("{}{}_{}", bucket_prefix(table), table.serial() + 1, millis);
    let mut path = dir.join(format!("{}.gor", base));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.gor", base, n));
        n += 1;
    }
    path
}
