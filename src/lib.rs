//! Genomic dictionary tables.
//!
//! A dictionary table lists the row files making up one logical table of
//! position-sorted genomic rows. Small files are packed into shared bucket
//! files under a table write lock, and readers merge every selected source
//! into one stream ordered by chromosome rank and position.
//!
//! ```no_run
//! use gordb::{EngineConfig, QueryOptions, Session};
//!
//! # fn main() -> gordb::Result<()> {
//! let session = Session::new(EngineConfig::default())?;
//! let table = session.load_table("variants.gord")?;
//! let filter = table.filter().tag_list("pn1,pn2")?;
//! let rows = session.open_table(&table, &[filter], QueryOptions::new().insert_source(true))?;
//! for row in rows {
//!     println!("{}", row?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flock;
pub mod iterator;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod session;
pub mod table;

pub use config::{BucketConfig, EngineConfig, LockConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use iterator::{BoxedIterator, CancelFlag, GenomicIterator, MergeIterator, MergeOptions};
pub use model::{ChromoLookup, GenomicRange, Header, Row, SourceRow};
pub use query::{open_table, QueryOptions};
pub use session::Session;
pub use table::{BucketManager, DictionaryEntry, DictionaryTable, PackLevel, TableFilter, TableLocks};
