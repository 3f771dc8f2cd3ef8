//! Reader and writer for tab separated `.gor` files.
//!
//! # File Format
//!
//! ```text
//! #Chrom<TAB>Pos<TAB>col3 ...      header, leading '#' optional
//! chr1<TAB>10179<TAB>C ...         rows sorted by (chromosome rank, pos)
//! ...
//! ```
//!
//! # Seeking
//!
//! `seek` bisects over byte offsets: it probes the first line starting at or
//! after the midpoint of the remaining window and keeps the half that can
//! still contain the first row with key >= target. Once the window is
//! smaller than [`SCAN_THRESHOLD`] the remainder is scanned linearly.

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{GenomicIterator, RowPredicate};
use crate::error::{Error, Result};
use crate::model::{ChromoLookup, Header, Row, SourceRow};

const SCAN_THRESHOLD: u64 = 8 * 1024;

pub struct GorFileIterator {
    path: PathBuf,
    name: String,
    header: Header,
    lookup: Arc<ChromoLookup>,
    reader: Option<BufReader<File>>,
    data_start: u64,
    file_len: u64,
    // Offset of the next unread byte.
    offset: u64,
    line: String,
    pending: Option<Row>,
    filter: Option<RowPredicate>,
    limit: Option<u64>,
    emitted: u64,
}

impl GorFileIterator {
    pub fn open(path: impl AsRef<Path>, lookup: Arc<ChromoLookup>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::source_io(&path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| Error::source_io(&path, e))?
            .len();
        let mut reader = BufReader::new(file);

        let mut header_line = String::new();
        let read = reader
            .read_line(&mut header_line)
            .map_err(|e| Error::source_io(&path, e))?;
        if read == 0 || header_line.trim().is_empty() {
            return Err(Error::InvalidRow {
                path,
                offset: 0,
                reason: "missing header line".to_string(),
            });
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            header: Header::parse(&header_line),
            name,
            lookup,
            reader: Some(reader),
            data_start: read as u64,
            file_len,
            offset: read as u64,
            line: String::new(),
            pending: None,
            filter: None,
            limit: None,
            emitted: 0,
            path,
        })
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        self.reader.as_mut().ok_or(Error::IteratorClosed)
    }

    fn io_err(&self, err: std::io::Error) -> Error {
        Error::source_io(&self.path, err)
    }

    fn reposition(&mut self, offset: u64) -> Result<()> {
        let result = self.reader()?.seek(SeekFrom::Start(offset));
        result.map_err(|e| self.io_err(e))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next non-empty row, or `None` at end of file.
    fn read_row(&mut self) -> Result<Option<Row>> {
        loop {
            let line_offset = self.offset;
            let mut line = std::mem::take(&mut self.line);
            line.clear();
            let result = self.reader()?.read_line(&mut line);
            let read = result.map_err(|e| self.io_err(e))?;
            if read == 0 {
                self.line = line;
                return Ok(None);
            }
            self.offset += read as u64;

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                self.line = line;
                continue;
            }
            let parsed = Row::parse(trimmed);
            self.line = line;
            return parsed.map(Some).map_err(|reason| Error::InvalidRow {
                path: self.path.clone(),
                offset: line_offset,
                reason,
            });
        }
    }

    /// Offset of the first line starting at or after `offset`.
    fn line_start_at_or_after(&mut self, offset: u64) -> Result<u64> {
        if offset <= self.data_start {
            return Ok(self.data_start);
        }
        self.reposition(offset - 1)?;
        let mut skipped = Vec::new();
        let result = self.reader()?.read_until(b'\n', &mut skipped);
        let read = result.map_err(|e| self.io_err(e))?;
        Ok(offset - 1 + read as u64)
    }

    fn bisect(&mut self, chr: &str, pos: u32) -> Result<u64> {
        let mut lo = self.data_start;
        let mut hi = self.file_len;

        while hi.saturating_sub(lo) > SCAN_THRESHOLD {
            let mid = lo + (hi - lo) / 2;
            let probe = self.line_start_at_or_after(mid)?;
            if probe >= hi {
                break;
            }
            self.reposition(probe)?;
            let row = match self.read_row()? {
                Some(row) => row,
                None => break,
            };
            match self.lookup.compare(row.chr(), row.pos(), chr, pos) {
                Ordering::Less => lo = probe,
                _ => hi = probe,
            }
        }
        Ok(lo)
    }
}

impl GenomicIterator for GorFileIterator {
    fn header(&self) -> &Header {
        &self.header
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, chr: &str, pos: u32) -> Result<bool> {
        self.pending = None;
        let start = self.bisect(chr, pos)?;
        self.reposition(start)?;

        while let Some(row) = self.read_row()? {
            if self.lookup.compare(row.chr(), row.pos(), chr, pos) != Ordering::Less {
                if self.filter.as_ref().map_or(true, |filter| filter(&row)) {
                    self.pending = Some(row);
                }
                break;
            }
        }
        self.has_next()
    }

    fn has_next(&mut self) -> Result<bool> {
        if self.reader.is_none() {
            return Err(Error::IteratorClosed);
        }
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(false);
        }
        if self.pending.is_some() {
            return Ok(true);
        }
        while let Some(row) = self.read_row()? {
            if self.filter.as_ref().map_or(true, |filter| filter(&row)) {
                self.pending = Some(row);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_row(&mut self) -> Result<SourceRow> {
        if !self.has_next()? {
            return Err(Error::NoSuchElement);
        }
        self.emitted += 1;
        self.pending
            .take()
            .map(SourceRow::Data)
            .ok_or(Error::NoSuchElement)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        self.pending = None;
        Ok(())
    }

    fn pushdown_filter(&mut self, predicate: RowPredicate) -> bool {
        let combined: RowPredicate = match self.filter.take() {
            Some(existing) => Arc::new(move |row: &Row| existing(row) && predicate(row)),
            None => predicate,
        };
        self.filter = Some(combined);
        true
    }

    fn pushdown_top(&mut self, limit: u64) -> bool {
        self.limit = Some(self.limit.map_or(limit, |current| current.min(limit)));
        true
    }
}

/// Writes a `.gor` file. Rows must be handed over in ascending order.
pub struct GorFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl GorFileWriter {
    pub fn create(path: impl AsRef<Path>, header: &Header) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::source_io(&path, e))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "#{}", header).map_err(|e| Error::source_io(&path, e))?;
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        writeln!(self.writer, "{}", row).map_err(|e| Error::source_io(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes and fsyncs the file, returning the number of rows written.
    pub fn finish(self) -> Result<u64> {
        let path = self.path;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| Error::source_io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| Error::source_io(&path, e))?;
        Ok(self.rows)
    }
}
