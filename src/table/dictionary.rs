//! Dictionary table file.
//!
//! # Format
//!
//! ```text
//! ## SERIAL = 7
//! ## COLUMNS = Chrom,Pos,Ref,Alt
//! #col comments and other '#' lines are ignored
//! pn1.gor|buckets/b_1.gor<TAB>pn1
//! pn2.gor<TAB>pn2
//! split.gor<TAB><TAB>chr1<TAB>0<TAB>chr1<TAB>1000
//! ```
//!
//! Properties other than `SERIAL` and `COLUMNS` are kept and written back
//! unchanged. Saving increments the serial and replaces the file atomically.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::debug;

use super::entry::DictionaryEntry;
use super::filter::TableFilter;
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, Header};

const SERIAL_KEY: &str = "SERIAL";
const COLUMNS_KEY: &str = "COLUMNS";

#[derive(Debug, Clone)]
pub struct DictionaryTable {
    path: PathBuf,
    root: PathBuf,
    serial: u64,
    columns: Option<Header>,
    properties: BTreeMap<String, String>,
    entries: Vec<DictionaryEntry>,
}

impl DictionaryTable {
    /// An empty table that will be stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let root = root_of(&path);
        Self {
            path,
            root,
            serial: 0,
            columns: None,
            properties: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path).map_err(|e| Error::source_io(&path, e))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let mut table = Self::new(path);

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(property) = line.strip_prefix("##") {
                if let Some((key, value)) = property.split_once('=') {
                    table.set_property(key.trim(), value.trim(), line_no)?;
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let entry = DictionaryEntry::parse(line, &table.root, &table.path, line_no)?;
            table.entries.push(entry);
        }
        debug!(table = %table.path.display(), entries = table.entries.len(), serial = table.serial, "loaded dictionary");
        Ok(table)
    }

    fn set_property(&mut self, key: &str, value: &str, line_no: usize) -> Result<()> {
        match key.to_ascii_uppercase().as_str() {
            SERIAL_KEY => {
                self.serial = value.parse().map_err(|_| Error::InvalidDictionary {
                    path: self.path.clone(),
                    line: line_no,
                    reason: format!("invalid serial '{}'", value),
                })?;
            }
            COLUMNS_KEY => {
                self.columns = Some(Header::new(value.split(',').map(str::trim)));
            }
            _ => {
                self.properties.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative entry paths resolve against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Declared column names, if the table has them.
    pub fn columns(&self) -> Option<&Header> {
        self.columns.as_ref()
    }

    pub fn set_columns(&mut self, columns: Header) {
        self.columns = Some(columns);
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> &[DictionaryEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [DictionaryEntry] {
        &mut self.entries
    }

    /// Registers an entry. Relative paths are resolved against the table
    /// directory.
    pub fn add_entry(&mut self, mut entry: DictionaryEntry) {
        entry.path = super::entry::resolve(&self.root, &entry.path);
        entry.bucket = entry
            .bucket
            .map(|bucket| super::entry::resolve(&self.root, bucket));
        self.entries.push(entry);
    }

    pub fn filter(&self) -> TableFilter {
        TableFilter::new()
    }

    pub fn select(&self, filter: &TableFilter, lookup: &ChromoLookup) -> Vec<&DictionaryEntry> {
        self.select_union(std::slice::from_ref(filter), lookup)
    }

    /// Entries matching any of `filters`, in dictionary order. No filters
    /// selects everything.
    pub fn select_union(&self, filters: &[TableFilter], lookup: &ChromoLookup) -> Vec<&DictionaryEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                filters.is_empty()
                    || filters
                        .iter()
                        .any(|filter| filter.matches(entry, &self.root, lookup))
            })
            .collect()
    }

    /// Writes the table with an incremented serial, replacing the file
    /// atomically.
    pub fn save(&mut self) -> Result<()> {
        self.serial += 1;
        let contents = self.format();

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        let tmp = self.root.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            self.serial -= 1;
            return Err(Error::source_io(&self.path, e));
        }
        debug!(table = %self.path.display(), serial = self.serial, "saved dictionary");
        Ok(())
    }

    pub fn format(&self) -> String {
        let mut out = format!("## {} = {}\n", SERIAL_KEY, self.serial);
        if let Some(columns) = &self.columns {
            out.push_str(&format!("## {} = {}\n", COLUMNS_KEY, columns.describe()));
        }
        for (key, value) in &self.properties {
            out.push_str(&format!("## {} = {}\n", key, value));
        }
        let body = self
            .entries
            .iter()
            .map(|entry| entry.format(&self.root))
            .join("\n");
        out.push_str(&body);
        if !self.entries.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn root_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DICT: &str = "## SERIAL = 3\n\
                        ## COLUMNS = Chrom,Pos,Data\n\
                        ## OWNER = lab\n\
                        #comment\n\
                        pn1.gor|b1.gor\tpn1\n\
                        \n\
                        pn2.gor|b1.gor\tpn2\n\
                        pn3.gor\tpn3\n";

    #[test]
    fn test_parse_properties_and_entries() {
        let table = DictionaryTable::parse("/w/t.gord", DICT).unwrap();
        assert_eq!(table.serial(), 3);
        assert_eq!(table.columns().unwrap().to_string(), "Chrom\tPos\tData");
        assert_eq!(table.property("OWNER"), Some("lab"));
        assert_eq!(table.entries().len(), 3);
        assert_eq!(table.entries()[1].bucket, Some(PathBuf::from("/w/b1.gor")));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = DictionaryTable::parse("/w/t.gord", "a.gor\tx\n## SERIAL = nope\n").unwrap_err();
        assert!(matches!(err, Error::InvalidDictionary { line: 2, .. }));
        let err = DictionaryTable::parse("/w/t.gord", "a.gor\tx\nb.gor\t\n").unwrap_err();
        assert!(matches!(err, Error::EmptyTag));
    }

    #[test]
    fn test_save_is_atomic_and_bumps_serial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.gord");
        fs::write(&path, DICT).unwrap();

        let mut table = DictionaryTable::load(&path).unwrap();
        table.add_entry(DictionaryEntry::new("pn4.gor").with_tag("pn4"));
        table.save().unwrap();

        let reloaded = DictionaryTable::load(&path).unwrap();
        assert_eq!(reloaded.serial(), 4);
        assert_eq!(reloaded.entries().len(), 4);
        assert_eq!(reloaded.entries()[3].path, dir.path().join("pn4.gor"));
        assert_eq!(reloaded.property("OWNER"), Some("lab"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("pn1.gor|b1.gor\tpn1\n"));
        assert!(text.ends_with("pn4.gor\tpn4\n"));
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_select_union() {
        let table = DictionaryTable::parse("/w/t.gord", DICT).unwrap();
        let lookup = ChromoLookup::new();
        let by_tag = table.filter().tags(["pn3"]).unwrap();
        let by_bucket = table.filter().buckets(["b1.gor"]);

        let names: Vec<String> = table
            .select_union(&[by_tag.clone(), by_bucket], &lookup)
            .iter()
            .map(|e| e.source_name())
            .collect();
        assert_eq!(names, vec!["pn1", "pn2", "pn3"]);
        assert_eq!(table.select(&by_tag, &lookup).len(), 1);
        assert_eq!(table.select_union(&[], &lookup).len(), 3);
    }
}
