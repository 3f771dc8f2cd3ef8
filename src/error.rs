use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::table::lock::LockKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Lock marker encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The lock was not obtained before the caller's deadline.
    #[error("Timed out after {timeout:?} waiting for {kind} lock '{name}' on table {table}")]
    LockTimeout {
        table: String,
        name: String,
        kind: LockKind,
        timeout: Duration,
    },

    /// Renew or release of a lock whose marker was removed or taken over.
    #[error("Lock '{name}' on table {table} is no longer held by {holder}")]
    LockLost {
        table: String,
        name: String,
        holder: String,
    },

    #[error("Lock error on {path}: {source}")]
    LockIo { path: PathBuf, source: io::Error },

    #[error(
        "Error initializing query: Header for {source_name} ({found}) is different from the first opened file {first_name} ({expected})"
    )]
    HeaderMismatch {
        first_name: String,
        expected: String,
        source_name: String,
        found: String,
    },

    #[error("Iterator is closed")]
    IteratorClosed,

    #[error("No more rows available")]
    NoSuchElement,

    /// Permanent error on a data source (missing file, bad permissions).
    #[error("Error reading {path}: {source}")]
    Resource { path: PathBuf, source: io::Error },

    /// Transient error on a data source, worth retrying.
    #[error("System error reading {path}: {source}")]
    System { path: PathBuf, source: io::Error },

    #[error("Invalid row in {path} at byte offset {offset}: {reason}")]
    InvalidRow {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Invalid dictionary {path} at line {line}: {reason}")]
    InvalidDictionary {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Empty tag is not allowed")]
    EmptyTag,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Wraps an I/O error raised while reading `path`, classifying it as
    /// permanent or transient.
    pub fn source_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        if is_transient_io(&err) {
            Error::System { path, source: err }
        } else {
            Error::Resource { path, source: err }
        }
    }

    /// True for failures a caller may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::System { .. } | Error::LockTimeout { .. } => true,
            Error::Io(err) => is_transient_io(err),
            _ => false,
        }
    }
}

#[cfg(target_os = "linux")]
const ESTALE: i32 = 116;
#[cfg(not(target_os = "linux"))]
const ESTALE: i32 = 70;

fn is_transient_io(err: &io::Error) -> bool {
    if err.raw_os_error() == Some(ESTALE) {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
