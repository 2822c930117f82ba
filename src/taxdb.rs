//src/taxdb.rs

use ahash::{AHashMap, AHashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{LcaError, Result};
use crate::files::open_reader;
use crate::types::{Lineage, LineagePair, Rank, TaxId, ROOT_TAXID};

pub type ParentMap = AHashMap<TaxId, TaxId>;
pub type NameMap = AHashMap<TaxId, String>;
pub type RankMap = AHashMap<TaxId, Rank>;

/// Name class kept from names.dmp.
const SCIENTIFIC_NAME: &str = "scientific name";

/// Result of a reverse name lookup at a given rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameLookup {
    Found(TaxId),
    NotFound,
    /// More than one taxon at the requested rank carries the name.
    Ambiguous(Vec<TaxId>),
}

/// An immutable taxonomy: parent pointers, ranks and scientific names.
#[derive(Debug, Default)]
pub struct TaxonomyTree {
    parents: ParentMap,
    ranks: RankMap,
    names: NameMap,
    /// name -> taxa carrying it, built on first reverse lookup
    name_index: OnceLock<AHashMap<String, Vec<TaxId>>>,
}

/// Splits one NCBI `.dmp` line on `\t|\t`, dropping the trailing `\t|`.
fn split_dmp_line(line: &str) -> Vec<&str> {
    let line = line.trim_end_matches(['\n', '\r']);
    let line = line.strip_suffix("\t|").unwrap_or(line);
    line.split("\t|\t").collect()
}

fn parse_taxid(field: &str, path: &Path, line: usize) -> Result<TaxId> {
    field.trim().parse().map_err(|_| LcaError::MalformedRecord {
        path: path.display().to_string(),
        line,
        reason: format!("bad taxid {field:?}"),
    })
}

fn malformed(path: &Path, line: usize, reason: String) -> LcaError {
    LcaError::MalformedRecord {
        path: path.display().to_string(),
        line,
        reason,
    }
}

/// Parses an NCBI nodes.dmp: `taxid | parent | rank | ...`
pub fn parse_nodes<P: AsRef<Path>>(path: P) -> Result<(ParentMap, RankMap)> {
    let path = path.as_ref();
    let reader = open_reader(path)?;

    let mut parent_map = ParentMap::new();
    let mut rank_map = RankMap::new();

    for (n, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_dmp_line(&line);
        if fields.len() < 3 {
            return Err(malformed(path, n + 1, format!("expected at least 3 fields, found {}", fields.len())));
        }

        let taxid = parse_taxid(fields[0], path, n + 1)?;
        let parent = parse_taxid(fields[1], path, n + 1)?;

        parent_map.insert(taxid, parent);
        rank_map.insert(taxid, Rank::from_table(fields[2]));
    }
    Ok((parent_map, rank_map))
}

/// Parses an NCBI names.dmp: `taxid | name | unique name | name class`.
/// Only scientific names are kept; a repeated taxid overwrites the earlier name.
pub fn parse_names<P: AsRef<Path>>(path: P) -> Result<NameMap> {
    let path = path.as_ref();
    let reader = open_reader(path)?;

    let mut name_map = NameMap::new();
    for (n, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_dmp_line(&line);
        if fields.len() != 4 {
            return Err(malformed(path, n + 1, format!("expected 4 fields, found {}", fields.len())));
        }

        let taxid = parse_taxid(fields[0], path, n + 1)?;
        if fields[3].trim() == SCIENTIFIC_NAME {
            name_map.insert(taxid, fields[1].to_string());
        }
    }
    Ok(name_map)
}

impl TaxonomyTree {
    /// Loads the NCBI nodes.dmp / names.dmp pair (either may be gzipped).
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(nodes_path: P, names_path: Q) -> Result<Self> {
        let (parents, ranks) = parse_nodes(&nodes_path)?;
        let names = parse_names(&names_path)?;
        log::info!(
            "Loaded taxonomy with {} nodes and {} scientific names",
            parents.len(),
            names.len()
        );
        Ok(Self::from_parts(parents, ranks, names))
    }

    /// Parses a krakenuniq taxDB file in the format:
    /// ```text
    /// <taxid>\t<parentid>\t<taxname>\t<rank>
    /// ```
    pub fn from_taxdb<P: AsRef<Path>>(filepath: P) -> Result<Self> {
        let path = filepath.as_ref();
        let reader = open_reader(path)?;

        let mut parents = ParentMap::new();
        let mut names = NameMap::new();
        let mut ranks = RankMap::new();

        for (n, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            // e.g. "2   1   Bacteria   superkingdom"
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 4 {
                return Err(malformed(path, n + 1, format!("expected 4 fields, found {}", parts.len())));
            }

            let taxid = parse_taxid(parts[0], path, n + 1)?;
            let parentid = parse_taxid(parts[1], path, n + 1)?;

            parents.insert(taxid, parentid);
            names.insert(taxid, parts[2].trim().to_string());
            ranks.insert(taxid, Rank::from_table(parts[3]));
        }
        log::info!("Loaded taxDB with {} nodes", parents.len());
        Ok(Self::from_parts(parents, ranks, names))
    }

    pub fn from_parts(parents: ParentMap, ranks: RankMap, names: NameMap) -> Self {
        Self {
            parents,
            ranks,
            names,
            name_index: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn contains(&self, taxid: TaxId) -> bool {
        self.parents.contains_key(&taxid)
    }

    pub fn rank_of(&self, taxid: TaxId) -> Option<Rank> {
        self.ranks.get(&taxid).copied()
    }

    pub fn name_of(&self, taxid: TaxId) -> Option<&str> {
        self.names.get(&taxid).map(String::as_str)
    }

    pub fn parent_of(&self, taxid: TaxId) -> Option<TaxId> {
        self.parents.get(&taxid).copied()
    }

    /// Ancestors of `taxid` (itself included), root first, root excluded.
    /// A taxon with no parent entry is treated as hanging off the root.
    pub fn lineage_as_taxids(&self, taxid: TaxId) -> Vec<TaxId> {
        let mut path = Vec::new();
        let mut node = taxid;
        // bounded walk: a malformed table could contain a cycle
        while node != ROOT_TAXID && path.len() <= self.parents.len() {
            path.push(node);
            match self.parents.get(&node) {
                Some(&p) if p != node => node = p,
                _ => break,
            }
        }
        path.reverse();
        path
    }

    /// Root-to-leaf `(rank, name)` lineage of `taxid`, keeping ancestors whose
    /// rank is in `wanted` (every fixed rank when `None`).
    pub fn lineage_of(&self, taxid: TaxId, wanted: Option<&[Rank]>) -> Lineage {
        let wanted = wanted.unwrap_or(&Rank::FIXED);
        let mut pairs = Vec::new();
        let mut node = taxid;
        let mut steps = 0;

        while node != ROOT_TAXID {
            let (Some(&rank), Some(&parent)) = (self.ranks.get(&node), self.parents.get(&node)) else {
                log::warn!("cannot find taxid {node} while walking lineage of {taxid}; truncating");
                break;
            };
            if rank != Rank::Unranked && wanted.contains(&rank) {
                match self.names.get(&node) {
                    Some(name) => pairs.push(LineagePair::new(rank, name.clone())),
                    None => log::warn!("taxid {node} has no scientific name"),
                }
            }
            steps += 1;
            if parent == node || steps > self.parents.len() {
                break;
            }
            node = parent;
        }

        pairs.reverse();
        Lineage::from_pairs(pairs)
    }

    /// Least common ancestor of an arbitrary set of taxa. Empty input, or taxa
    /// sharing nothing but the root, give `ROOT_TAXID`.
    pub fn lca<I>(&self, taxa: I) -> TaxId
    where
        I: IntoIterator<Item = TaxId>,
    {
        let mut iter = taxa.into_iter();
        let Some(first) = iter.next() else {
            return ROOT_TAXID;
        };

        let mut path = self.lineage_as_taxids(first);
        for taxid in iter {
            if path.is_empty() {
                break;
            }
            let other: AHashSet<TaxId> = self.lineage_as_taxids(taxid).into_iter().collect();
            path.retain(|t| other.contains(t));
        }

        path.last().copied().unwrap_or(ROOT_TAXID)
    }

    fn name_index(&self) -> &AHashMap<String, Vec<TaxId>> {
        self.name_index.get_or_init(|| {
            let mut index: AHashMap<String, Vec<TaxId>> = AHashMap::new();
            for (&taxid, name) in &self.names {
                index.entry(name.clone()).or_default().push(taxid);
            }
            for taxa in index.values_mut() {
                taxa.sort_unstable();
            }
            log::debug!("built name index over {} names", index.len());
            index
        })
    }

    /// Reverse lookup of a scientific name restricted to `rank`.
    pub fn get_taxid_for_name(&self, name: &str, rank: Rank) -> NameLookup {
        let Some(candidates) = self.name_index().get(name) else {
            return NameLookup::NotFound;
        };

        let at_rank: Vec<TaxId> = candidates
            .iter()
            .copied()
            .filter(|&t| self.rank_of(t) == Some(rank))
            .collect();

        match at_rank.len() {
            0 => NameLookup::NotFound,
            1 => NameLookup::Found(at_rank[0]),
            _ => NameLookup::Ambiguous(at_rank),
        }
    }
}
