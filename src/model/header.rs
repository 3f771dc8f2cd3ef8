use std::fmt;

pub const DEFAULT_SOURCE_COLUMN: &str = "Source";

/// Column names of a genomic source. The first two columns are always the
/// chromosome and the position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    columns: Vec<String>,
}

impl Header {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a header line, dropping leading `#` characters.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = line.trim_start_matches('#');
        Self::new(line.split('\t'))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Same column count and case-insensitively equal names.
    pub fn matches(&self, other: &Header) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// The header as seen through a merge that inserts a source column.
    ///
    /// Sources that carry their own discriminator column get it renamed in
    /// place; all others get the column appended.
    pub fn with_source_column(&self, name: &str, already_inserted: bool) -> Header {
        let mut columns = self.columns.clone();
        match columns.last_mut() {
            Some(last) if already_inserted => *last = name.to_string(),
            _ => columns.push(name.to_string()),
        }
        Header { columns }
    }

    /// Projects onto the given value columns (indices after chrom/pos).
    pub fn select(&self, value_columns: &[usize]) -> Header {
        let mut columns: Vec<String> = self.columns.iter().take(2).cloned().collect();
        columns.extend(
            value_columns
                .iter()
                .filter_map(|&idx| self.columns.get(idx + 2).cloned()),
        );
        Header { columns }
    }

    pub fn describe(&self) -> String {
        self.columns.join(",")
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.columns.join("\t"))
    }
}
