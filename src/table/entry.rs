use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::GenomicRange;

/// One logical data source of a dictionary table.
///
/// Paths are held resolved against the table directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub path: PathBuf,
    pub alias: Option<String>,
    pub tag: Option<String>,
    pub range: Option<GenomicRange>,
    pub bucket: Option<PathBuf>,
}

impl DictionaryEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias: None,
            tag: None,
            range: None,
            bucket: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_range(mut self, range: GenomicRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<PathBuf>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Alias, else tag, else the file stem of the path.
    pub fn source_name(&self) -> String {
        self.alias
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .or_else(|| self.tag.as_deref().filter(|tag| !tag.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    pub fn is_bucketed(&self) -> bool {
        self.bucket.is_some()
    }

    /// Parses one record:
    /// `path[|bucket]\ttag[\tstartChr\tstartPos\tstopChr\tstopPos[\talias]]`.
    pub(crate) fn parse(line: &str, root: &Path, table: &Path, line_no: usize) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidDictionary {
            path: table.to_path_buf(),
            line: line_no,
            reason,
        };
        let fields: Vec<&str> = line.split('\t').collect();

        let (file, bucket) = match fields[0].split_once('|') {
            Some((file, bucket)) => (file, Some(bucket)),
            None => (fields[0], None),
        };
        if file.trim().is_empty() {
            return Err(invalid("missing file path".to_string()));
        }

        let range = match fields.len() {
            0..=2 => None,
            6 | 7 if fields[2..6].iter().all(|f| f.trim().is_empty()) => None,
            6 | 7 => {
                let pos = |s: &str| {
                    s.trim()
                        .parse::<u32>()
                        .map_err(|_| invalid(format!("invalid position '{}'", s)))
                };
                Some(GenomicRange::new(
                    fields[2],
                    pos(fields[3])?,
                    fields[4],
                    pos(fields[5])?,
                ))
            }
            n => return Err(invalid(format!("expected 2, 6 or 7 columns, found {}", n))),
        };

        let tag = fields.get(1).map(|tag| tag.trim().to_string());
        let alias = fields
            .get(6)
            .map(|alias| alias.trim().to_string())
            .filter(|alias| !alias.is_empty());
        if tag.as_deref() == Some("") && range.is_none() && alias.is_none() {
            return Err(Error::EmptyTag);
        }

        Ok(Self {
            path: resolve(root, file),
            alias,
            tag: tag.filter(|tag| !tag.is_empty()),
            range,
            bucket: bucket
                .filter(|bucket| !bucket.trim().is_empty())
                .map(|bucket| resolve(root, bucket)),
        })
    }

    /// Formats the record, writing paths under `root` relative to it.
    pub fn format(&self, root: &Path) -> String {
        let mut line = relativize(root, &self.path);
        if let Some(bucket) = &self.bucket {
            line.push('|');
            line.push_str(&relativize(root, bucket));
        }
        if self.tag.is_some() || self.range.is_some() || self.alias.is_some() {
            line.push('\t');
            line.push_str(self.tag.as_deref().unwrap_or(""));
        }
        if let Some(range) = &self.range {
            line.push('\t');
            line.push_str(&range.to_string());
        }
        if let Some(alias) = &self.alias {
            if self.range.is_none() {
                // Empty range columns in front of the alias.
                line.push_str("\t\t\t\t");
            }
            line.push('\t');
            line.push_str(alias);
        }
        line
    }
}

/// Resolves `path` against `root` and removes `.` and `..` components.
pub fn resolve(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn relativize(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
