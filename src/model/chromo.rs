//! Canonical chromosome ordering.
//!
//! Rows are ordered by chromosome *rank*, not by the lexical order of the
//! chromosome name: `chr2` sorts before `chr10`. The mapping from name to rank
//! is computed once per name and cached by a [`ChromoLookup`] instance that is
//! owned by the session and handed to every component that compares keys.
//!
//! ```text
//! chr1 < chr2 < ... < chr22 < chrX < chrY < chrXY < chrM < (others, lexical)
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

const RANK_X: u32 = 1_000_000;
const RANK_Y: u32 = RANK_X + 1;
const RANK_XY: u32 = RANK_X + 2;
const RANK_M: u32 = RANK_X + 3;
const RANK_OTHER: u32 = u32::MAX;

/// Position of a chromosome in the canonical order.
///
/// Names that share an order value (only possible for unrecognised names)
/// fall back to comparing the normalised name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChromRank {
    order: u32,
    name: Arc<str>,
}

impl ChromRank {
    pub fn order(&self) -> u32 {
        self.order
    }
}

impl Ord for ChromRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ChromRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A fully ranked genomic coordinate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RankedKey {
    pub rank: ChromRank,
    pub pos: u32,
}

/// Name-to-rank lookup with a per-instance cache.
#[derive(Debug, Default)]
pub struct ChromoLookup {
    cache: RwLock<HashMap<String, ChromRank>>,
}

impl ChromoLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn rank(&self, chr: &str) -> ChromRank {
        if let Some(rank) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chr)
        {
            return rank.clone();
        }

        let rank = compute_rank(chr);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chr.to_string())
            .or_insert(rank)
            .clone()
    }

    pub fn key(&self, chr: &str, pos: u32) -> RankedKey {
        RankedKey {
            rank: self.rank(chr),
            pos,
        }
    }

    /// Compares two coordinates in canonical order.
    pub fn compare(&self, chr_a: &str, pos_a: u32, chr_b: &str, pos_b: u32) -> Ordering {
        if chr_a == chr_b {
            return pos_a.cmp(&pos_b);
        }
        self.rank(chr_a)
            .cmp(&self.rank(chr_b))
            .then(pos_a.cmp(&pos_b))
    }

    /// Number of distinct names seen so far.
    pub fn cached_names(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn compute_rank(chr: &str) -> ChromRank {
    let stripped = match chr.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &chr[3..],
        _ => chr,
    };
    let normalised = stripped.to_ascii_uppercase();

    let order = match normalised.as_str() {
        "X" => RANK_X,
        "Y" => RANK_Y,
        "XY" => RANK_XY,
        "M" | "MT" => RANK_M,
        other => match other.parse::<u32>() {
            Ok(n) if n < RANK_X => n,
            _ => RANK_OTHER,
        },
    };

    ChromRank {
        order,
        name: Arc::from(normalised),
    }
}
