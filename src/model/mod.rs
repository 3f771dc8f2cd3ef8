pub mod chromo;
pub mod header;
pub mod range;
pub mod row;

pub use chromo::{ChromRank, ChromoLookup, RankedKey};
pub use header::{Header, DEFAULT_SOURCE_COLUMN};
pub use range::GenomicRange;
pub use row::{Row, SourceRow};
