use std::fmt;

/// One genomic row: chromosome, position and the remaining column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    chr: String,
    pos: u32,
    values: Vec<String>,
}

impl Row {
    pub fn new(chr: impl Into<String>, pos: u32, values: Vec<String>) -> Self {
        Self {
            chr: chr.into(),
            pos,
            values,
        }
    }

    /// Parses a tab separated line. The error is a human readable reason.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let mut fields = line.split('\t');

        let chr = match fields.next() {
            Some(chr) if !chr.is_empty() => chr,
            _ => return Err("missing chromosome column".to_string()),
        };
        let pos = fields
            .next()
            .ok_or_else(|| "missing position column".to_string())?;
        let pos = pos
            .parse::<u32>()
            .map_err(|e| format!("invalid position '{}': {}", pos, e))?;

        Ok(Self {
            chr: chr.to_string(),
            pos,
            values: fields.map(str::to_string).collect(),
        })
    }

    pub fn chr(&self) -> &str {
        &self.chr
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Total column count, chromosome and position included.
    pub fn num_cols(&self) -> usize {
        self.values.len() + 2
    }

    pub fn value(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    pub fn last_value(&self) -> Option<&str> {
        self.values.last().map(String::as_str)
    }

    pub fn push_value(&mut self, value: impl Into<String>) {
        self.values.push(value.into());
    }

    /// Overwrites the last column, appending when the row only has the key.
    pub fn set_last_value(&mut self, value: impl Into<String>) {
        match self.values.last_mut() {
            Some(last) => *last = value.into(),
            None => self.values.push(value.into()),
        }
    }

    /// Keeps the listed value columns (0 is the first column after position).
    pub fn select(self, columns: &[usize]) -> Row {
        let values = columns
            .iter()
            .filter_map(|&idx| self.values.get(idx).cloned())
            .collect();
        Row {
            chr: self.chr,
            pos: self.pos,
            values,
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.chr, self.pos)?;
        for value in &self.values {
            write!(f, "\t{}", value)?;
        }
        Ok(())
    }
}

/// What a source yields: a data row, or a progress heartbeat at a key.
///
/// Progress rows let slow sources report how far they got so that the merge
/// can poll for cancellation; they never reach the caller of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRow {
    Data(Row),
    Progress { chr: String, pos: u32 },
}

impl SourceRow {
    pub fn progress(chr: impl Into<String>, pos: u32) -> Self {
        SourceRow::Progress {
            chr: chr.into(),
            pos,
        }
    }

    pub fn chr(&self) -> &str {
        match self {
            SourceRow::Data(row) => row.chr(),
            SourceRow::Progress { chr, .. } => chr,
        }
    }

    pub fn pos(&self) -> u32 {
        match self {
            SourceRow::Data(row) => row.pos(),
            SourceRow::Progress { pos, .. } => *pos,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, SourceRow::Progress { .. })
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            SourceRow::Data(row) => Some(row),
            SourceRow::Progress { .. } => None,
        }
    }
}

impl From<Row> for SourceRow {
    fn from(row: Row) -> Self {
        SourceRow::Data(row)
    }
}
