//src/types.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric taxon identifier (NCBI taxid).
pub type TaxId = u32;

/// The sentinel root of every taxonomy.
pub const ROOT_TAXID: TaxId = 1;

/// The fixed, ordered rank enumeration. Any other rank string in a taxonomy
/// table becomes `Unranked`, which never shows up in a `Lineage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Superkingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    Unranked,
}

impl Rank {
    /// Ranks a lineage may contain, root to leaf.
    pub const FIXED: [Rank; 7] = [
        Rank::Superkingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Superkingdom => "superkingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::Unranked => "unranked",
        }
    }

    /// Column position in a classification row, `None` for `Unranked`.
    pub fn column(&self) -> Option<usize> {
        Rank::FIXED.iter().position(|r| r == self)
    }

    /// Single-letter code used in kraken-style reports.
    pub fn code(&self) -> char {
        match self {
            Rank::Superkingdom => 'D',
            Rank::Phylum => 'P',
            Rank::Class => 'C',
            Rank::Order => 'O',
            Rank::Family => 'F',
            Rank::Genus => 'G',
            Rank::Species => 'S',
            Rank::Unranked => '-',
        }
    }

    /// Parses a taxonomy-table rank string. Never fails: unknown ranks
    /// ("no rank", "strain", "subspecies", ...) map to `Unranked`.
    pub fn from_table(s: &str) -> Rank {
        s.parse().unwrap_or(Rank::Unranked)
    }
}

impl FromStr for Rank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // newer NCBI dumps call the top rank "domain"
            "superkingdom" | "domain" => Ok(Rank::Superkingdom),
            "phylum" => Ok(Rank::Phylum),
            "class" => Ok(Rank::Class),
            "order" => Ok(Rank::Order),
            "family" => Ok(Rank::Family),
            "genus" => Ok(Rank::Genus),
            "species" => Ok(Rank::Species),
            other => Err(format!("not a lineage rank: {other}")),
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(rank, name)` step of a lineage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineagePair {
    pub rank: Rank,
    pub name: String,
}

impl LineagePair {
    pub fn new(rank: Rank, name: impl Into<String>) -> Self {
        Self { rank, name: name.into() }
    }
}

impl fmt::Display for LineagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.name)
    }
}

/// Root-to-leaf sequence of `(rank, name)` pairs, possibly sparse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Lineage(Vec<LineagePair>);

impl Lineage {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs(pairs: Vec<LineagePair>) -> Self {
        Self(pairs)
    }

    pub fn push(&mut self, pair: LineagePair) {
        self.0.push(pair);
    }

    pub fn pairs(&self) -> &[LineagePair] {
        &self.0
    }

    pub fn into_pairs(self) -> Vec<LineagePair> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The most specific entry, if any.
    pub fn last(&self) -> Option<&LineagePair> {
        self.0.last()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn get(&self, rank: Rank) -> Option<&str> {
        self.0.iter().find(|p| p.rank == rank).map(|p| p.name.as_str())
    }

    /// True when ranks are strictly increasing in the fixed order.
    pub fn is_rank_ordered(&self) -> bool {
        self.0.windows(2).all(|w| w[0].rank < w[1].rank)
    }

    /// Names laid out one column per fixed rank, blank where absent.
    pub fn to_columns(&self) -> Vec<String> {
        debug_assert!(self.is_rank_ordered(), "lineage out of rank order: {self}");
        let mut cols = vec![String::new(); Rank::FIXED.len()];
        for pair in &self.0 {
            if let Some(i) = pair.rank.column() {
                cols[i] = pair.name.clone();
            }
        }
        cols
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names();
        f.write_str(&names.join(";"))
    }
}

/// A structured representation of one row of the per-query abundance report.
///   %  below  at  code  name
#[derive(Debug, Clone)]
pub struct LineageReportRow {
    pub pct: f32,
    pub count_below: u32,
    pub count_at: u32,
    pub rank_code: char,
    pub name: String,
    pub depth: usize,
}
