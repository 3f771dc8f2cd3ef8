//! Resolves a dictionary table into one merged row stream.
//!
//! ```text
//! entries ──filter──> selected ──plan──> sources ──open (retry)──> MergeIterator
//!
//!   pn1.gor                      GorFileIterator
//!   pn2.gor  chr1:0-1000         RangeIterator(GorFileIterator)
//!   pn3|b1, pn4|b1               BucketIterator(b1, {pn3, pn4})
//!   pn5|b2   chr2:0-10           RangeIterator(BucketIterator(b2, {pn5}))
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::iterator::{
    open_with_retry, BoxedIterator, BucketIterator, CancelFlag, GenomicIterator, GorFileIterator,
    MergeIterator, MergeOptions, RangeIterator,
};
use crate::model::ChromoLookup;
use crate::session::Session;
use crate::table::{DictionaryEntry, DictionaryTable, TableFilter};

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub merge: MergeOptions,
    pub cancel: Option<CancelFlag>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_source(mut self, insert_source: bool) -> Self {
        self.merge.insert_source = insert_source;
        self
    }

    pub fn source_column(mut self, name: impl Into<String>) -> Self {
        self.merge.source_column = name.into();
        self
    }

    pub fn cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

enum SourcePlan<'a> {
    File(&'a DictionaryEntry),
    SharedBucket {
        bucket: &'a Path,
        members: HashSet<String>,
    },
    BucketMember(&'a DictionaryEntry),
}

impl SourcePlan<'_> {
    fn describe(&self) -> String {
        match self {
            SourcePlan::File(entry) | SourcePlan::BucketMember(entry) => {
                format!("{} ({})", entry.path.display(), entry.source_name())
            }
            SourcePlan::SharedBucket { bucket, .. } => bucket.display().to_string(),
        }
    }
}

/// Opens every source the filters select and merges them.
///
/// Unbucketed entries are read from their own files. Bucketed entries
/// without a range share one iterator per bucket, filtered to the selected
/// members; bucketed entries with a range get one filtered iterator each.
pub fn open_table(
    session: &Session,
    table: &DictionaryTable,
    filters: &[TableFilter],
    options: QueryOptions,
) -> Result<MergeIterator> {
    let lookup = session.lookup();
    let selected = table.select_union(filters, lookup);
    let plans = plan_sources(&selected);
    let keep_source = options.merge.insert_source;
    debug!(
        table = %table.path().display(),
        entries = selected.len(),
        sources = plans.len(),
        "resolved table sources"
    );

    let mut sources: Vec<BoxedIterator> = Vec::with_capacity(plans.len());
    for plan in &plans {
        let opened = open_with_retry(session.retry(), &plan.describe(), || {
            open_plan(plan, keep_source, lookup)
        });
        match opened {
            Ok(source) => sources.push(source),
            Err(err) => {
                close_opened(&mut sources);
                return Err(err);
            }
        }
    }

    MergeIterator::new(sources, options.merge, lookup.clone(), options.cancel)
}

fn plan_sources<'a>(entries: &[&'a DictionaryEntry]) -> Vec<SourcePlan<'a>> {
    let mut plans = Vec::new();
    let mut shared: HashMap<&'a Path, usize> = HashMap::new();

    for &entry in entries {
        match (&entry.bucket, &entry.range) {
            (None, _) => plans.push(SourcePlan::File(entry)),
            (Some(_), Some(_)) => plans.push(SourcePlan::BucketMember(entry)),
            (Some(bucket), None) => {
                let bucket = bucket.as_path();
                match shared.get(bucket) {
                    Some(&idx) => {
                        if let SourcePlan::SharedBucket { members, .. } = &mut plans[idx] {
                            members.insert(entry.source_name());
                        }
                    }
                    None => {
                        shared.insert(bucket, plans.len());
                        plans.push(SourcePlan::SharedBucket {
                            bucket,
                            members: HashSet::from([entry.source_name()]),
                        });
                    }
                }
            }
        }
    }
    plans
}

fn open_plan(plan: &SourcePlan<'_>, keep_source: bool, lookup: &Arc<ChromoLookup>) -> Result<BoxedIterator> {
    match plan {
        SourcePlan::File(entry) => open_entry_file(entry, lookup),
        SourcePlan::BucketMember(entry) => open_bucket_member(entry, keep_source, lookup),
        SourcePlan::SharedBucket { bucket, members } => Ok(Box::new(BucketIterator::open(
            bucket,
            members.clone(),
            keep_source,
            lookup.clone(),
        )?)),
    }
}

/// Opens an unbucketed entry's file, restricted to its range.
pub(crate) fn open_entry_file(entry: &DictionaryEntry, lookup: &Arc<ChromoLookup>) -> Result<BoxedIterator> {
    let file = GorFileIterator::open(&entry.path, lookup.clone())?.with_source_name(entry.source_name());
    Ok(with_range(file, entry, lookup))
}

/// Opens one member of a bucket, restricted to its range.
pub(crate) fn open_bucket_member(
    entry: &DictionaryEntry,
    keep_source: bool,
    lookup: &Arc<ChromoLookup>,
) -> Result<BoxedIterator> {
    let bucket: &PathBuf = entry.bucket.as_ref().ok_or_else(|| {
        Error::InvalidState(format!("{} has no bucket", entry.path.display()))
    })?;
    let name = entry.source_name();
    let members = HashSet::from([name.clone()]);
    let iter = BucketIterator::open(bucket, members, keep_source, lookup.clone())?.with_source_name(name);
    Ok(with_range(iter, entry, lookup))
}

fn with_range<I>(iter: I, entry: &DictionaryEntry, lookup: &Arc<ChromoLookup>) -> BoxedIterator
where
    I: GenomicIterator + 'static,
{
    match &entry.range {
        Some(range) => Box::new(RangeIterator::new(iter, range.clone(), lookup.clone())),
        None => Box::new(iter),
    }
}

pub(crate) fn close_opened(sources: &mut Vec<BoxedIterator>) {
    for mut source in sources.drain(..) {
        if let Err(err) = source.close() {
            warn!(source = source.source_name(), error = %err, "failed to close source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::iterator::NoRetry;
    use crate::model::Row;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn session() -> Session {
        Session::new(EngineConfig::default()).unwrap().with_retry(NoRetry)
    }

    fn lines(merge: MergeIterator) -> Vec<String> {
        merge
            .map(|row| row.map(|r: Row| r.to_string()))
            .collect::<Result<_>>()
            .unwrap()
    }

    fn setup(dir: &Path) -> DictionaryTable {
        write(dir, "pn1.gor", "chrom\tpos\tcol1\nchr1\t1\tpn1gor\n");
        write(dir, "pn2.gor", "chrom\tpos\tcol1\nchr1\t1\tpn2gor\n");
        write(dir, "pn3.gor", "chrom\tpos\tcol1\nchr1\t2\tpn3gor\n");
        write(dir, "pn4.gor", "chrom\tpos\tcol1\nchr1\t2\tpn4gor\n");
        write(
            dir,
            "bucket1.gor",
            "chrom\tpos\tcol1\tSource\nchr1\t1\tpn1gor\tpn1\nchr1\t1\tpn2gor\tpn2\n",
        );
        write(
            dir,
            "t.gord",
            &format!(
                "pn1.gor|bucket1.gor\tpn1\n{}|bucket1.gor\tpn2\npn3.gor\tpn3\npn4.gor\tpn4\tchr1\t0\tchr1\t1\n",
                dir.join("pn2.gor").display()
            ),
        );
        DictionaryTable::load(dir.join("t.gord")).unwrap()
    }

    #[test]
    fn test_plan_shares_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let table = setup(dir.path());
        let selected: Vec<&DictionaryEntry> = table.entries().iter().collect();
        let plans = plan_sources(&selected);
        assert_eq!(plans.len(), 3);
        assert!(matches!(&plans[0], SourcePlan::SharedBucket { members, .. } if members.len() == 2));
    }

    #[test]
    fn test_open_table_with_source_column() {
        let dir = tempfile::tempdir().unwrap();
        let table = setup(dir.path());
        let merge = open_table(
            &session(),
            &table,
            &[],
            QueryOptions::new().insert_source(true).source_column("PN"),
        )
        .unwrap();
        assert_eq!(merge.header().to_string(), "chrom\tpos\tcol1\tPN");
        // pn4 is restricted to chr1:0-1 and drops out.
        assert_eq!(
            lines(merge),
            vec![
                "chr1\t1\tpn1gor\tpn1",
                "chr1\t1\tpn2gor\tpn2",
                "chr1\t2\tpn3gor\tpn3",
            ]
        );
    }

    #[test]
    fn test_open_table_without_source_column() {
        let dir = tempfile::tempdir().unwrap();
        let table = setup(dir.path());
        let filter = table.filter().tags(["pn2", "pn3"]).unwrap();
        let merge = open_table(&session(), &table, &[filter], QueryOptions::new()).unwrap();
        assert_eq!(merge.header().to_string(), "chrom\tpos\tcol1");
        assert_eq!(lines(merge), vec!["chr1\t1\tpn2gor", "chr1\t2\tpn3gor"]);
    }

    #[test]
    fn test_missing_source_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let table = setup(dir.path());
        fs::remove_file(dir.path().join("pn3.gor")).unwrap();
        let err = open_table(&session(), &table, &[], QueryOptions::new()).err().unwrap();
        assert!(matches!(err, Error::Resource { ref path, .. } if path.ends_with("pn3.gor")));
    }

    #[test]
    fn test_ranged_entries_in_either_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "f1.gor", "Chrom\tPos\tData\nchr1\t1\t1\n");
        write(dir.path(), "f2.gor", "Chrom\tPos\tData\nchr1\t2000\t1\n");
        for dict in [
            "f1.gor\tfirst\tchr1\t0\tchr1\t1000\nf2.gor\tsecond\tchr1\t1001\tchr1\t3000\n",
            "f2.gor\tsecond\tchr1\t1001\tchr1\t3000\nf1.gor\tfirst\tchr1\t0\tchr1\t1000\n",
        ] {
            write(dir.path(), "r.gord", dict);
            let table = DictionaryTable::load(dir.path().join("r.gord")).unwrap();
            let merge = open_table(&session(), &table, &[], QueryOptions::new()).unwrap();
            assert_eq!(lines(merge), vec!["chr1\t1\t1", "chr1\t2000\t1"]);
        }
    }
}
