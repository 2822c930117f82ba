// src/classify/classify_sketch.rs

use ahash::AHashMap;
use std::collections::BTreeMap;

use super::lineage_tree::{LineageParents, LineageTree};
use crate::error::{LcaError, Result};
use crate::lca_db::LcaDatabase;
use crate::sketch::Sketch;
use crate::types::{Lineage, LineagePair, Rank};

/// Minimum number of hashes a lineage node needs before it votes.
pub const DEFAULT_THRESHOLD: u32 = 5;

/// A lineage node, `None` being the synthetic root.
type NodeKey = Option<LineagePair>;

/// Consensus classification of one query sketch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusResult {
    pub name: String,
    /// The selected lineage, root to leaf; empty when nothing passed the threshold.
    pub lineage: Lineage,
    /// Children of the selected node in the confirmed tree: 0 for a leaf,
    /// more than one when support is split below `lineage`.
    pub reason: usize,
    /// Hashes in the (downsampled) query.
    pub total_hashes: usize,
    /// Hashes with at least one candidate lineage.
    pub assigned_hashes: usize,
    /// Per-hash resolved nodes and how many hashes resolved to each, most
    /// supported first.
    pub hash_counts: Vec<(Lineage, u32)>,
    /// Re-aggregated support of every ancestor of an above-threshold node.
    pub support: Vec<(Lineage, u32)>,
}

impl ConsensusResult {
    /// Support is split between two or more taxa below `lineage`.
    pub fn is_split(&self) -> bool {
        self.reason > 1
    }

    pub fn csv_header() -> Vec<&'static str> {
        let mut header = vec!["ID"];
        header.extend(Rank::FIXED.iter().map(Rank::as_str));
        header
    }

    /// `ID, superkingdom, ..., species`; blank where the lineage stops.
    pub fn to_record(&self) -> Vec<String> {
        assert!(
            self.lineage.is_rank_ordered(),
            "classification of {} is out of taxonomic order: {}",
            self.name,
            self.lineage
        );
        let mut row = Vec::with_capacity(Rank::FIXED.len() + 1);
        row.push(self.name.clone());
        row.extend(self.lineage.to_columns());
        row
    }
}

/// Threshold-based consensus classifier over one or more LCA databases that
/// share ksize and scaled.
#[derive(Debug, Clone)]
pub struct ConsensusClassifier<'a> {
    databases: &'a [LcaDatabase],
    ksize: u32,
    scaled: u64,
    threshold: u32,
}

impl<'a> ConsensusClassifier<'a> {
    pub fn new(databases: &'a [LcaDatabase], threshold: u32) -> Result<Self> {
        let first = databases
            .first()
            .ok_or_else(|| LcaError::IncompatibleDatabases("no databases given".to_string()))?;

        for db in &databases[1..] {
            if db.ksize != first.ksize {
                return Err(LcaError::IncompatibleDatabases(format!(
                    "multiple ksizes ({} and {})",
                    first.ksize, db.ksize
                )));
            }
            if db.scaled != first.scaled {
                return Err(LcaError::IncompatibleDatabases(format!(
                    "multiple scaled values ({} and {})",
                    first.scaled, db.scaled
                )));
            }
        }

        log::info!(
            "classifier over {} database(s), ksize={} scaled={} threshold={}",
            databases.len(),
            first.ksize,
            first.scaled,
            threshold
        );
        Ok(Self {
            databases,
            ksize: first.ksize,
            scaled: first.scaled,
            threshold,
        })
    }

    pub fn ksize(&self) -> u32 {
        self.ksize
    }

    pub fn scaled(&self) -> u64 {
        self.scaled
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Classifies one query. Never mutates shared state, so repeated calls
    /// give identical results.
    pub fn classify<S: Sketch>(&self, query: &S) -> Result<ConsensusResult> {
        if query.ksize() != self.ksize {
            return Err(LcaError::IncompatibleDatabases(format!(
                "query {} has ksize {}, databases have ksize {}",
                query.name(),
                query.ksize(),
                self.ksize
            )));
        }
        // bring the query to the databases' scaled value; a coarser query whose
        // factor is a multiple of it already holds only retained hashes
        let downsampled;
        let hashes = if query.scaled() > self.scaled {
            if query.scaled() % self.scaled.max(1) != 0 {
                return Err(LcaError::ScaledMismatch {
                    name: query.name().to_string(),
                    current: query.scaled(),
                    requested: self.scaled,
                });
            }
            query.hash_values()
        } else {
            downsampled = query.downsample(self.scaled)?;
            downsampled.hash_values()
        };

        // 1. gather candidate lineages per hash, across all databases
        let mut candidates: BTreeMap<u64, Vec<&Lineage>> = BTreeMap::new();
        for &hashval in hashes {
            for db in self.databases {
                for lineage in db.lineages_for_hash(hashval) {
                    candidates.entry(hashval).or_default().push(lineage);
                }
            }
        }

        // 2. per-hash LCA: leaf or first branching node of the candidate tree
        let mut parents = LineageParents::new();
        let mut counts: AHashMap<NodeKey, u32> = AHashMap::new();
        for (hashval, lineages) in &candidates {
            let tree = LineageTree::from_lineages(lineages.iter().copied());
            for lineage in lineages {
                parents.record(lineage);
            }

            let (lca, reason) = tree.find_lca();
            log::trace!("hash {hashval}: {} candidates -> {:?} ({reason})", lineages.len(), lca);
            *counts.entry(lca.cloned()).or_insert(0) += 1;
        }

        // 3. most supported nodes first; ties broken by node for determinism
        let mut ranked: Vec<(NodeKey, u32)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        log::debug!("{}: {} hashvals over {} nodes", query.name(), candidates.len(), ranked.len());

        // 4. above-threshold nodes vote for themselves and all their ancestors
        let mut confirmed = LineageTree::new();
        let mut support: AHashMap<NodeKey, u32> = AHashMap::new();
        for (node, count) in &ranked {
            if *count < self.threshold {
                break;
            }
            *support.entry(None).or_insert(0) += count;

            let Some(pair) = node else {
                continue;
            };
            let path = parents.path_from_root(pair);
            for ancestor in &path {
                *support.entry(Some(ancestor.clone())).or_insert(0) += count;
            }
            log::debug!("  {count} -> {}", Lineage::from_pairs(path.clone()));
            confirmed.insert(path.iter());
        }

        // 5. resolve the confirmed tree the same way and walk back up
        let (lca, reason) = confirmed.find_lca();
        let lineage = match lca {
            Some(pair) => Lineage::from_pairs(parents.path_from_root(pair)),
            None => Lineage::new(),
        };
        if reason > 1 {
            log::debug!("{}: support split {reason} ways below {lineage}", query.name());
        }

        let to_lineage = |node: &NodeKey| match node {
            Some(pair) => Lineage::from_pairs(parents.path_from_root(pair)),
            None => Lineage::new(),
        };
        let hash_counts = ranked.iter().map(|(node, c)| (to_lineage(node), *c)).collect();
        let mut support: Vec<(Lineage, u32)> = support.iter().map(|(node, c)| (to_lineage(node), *c)).collect();
        support.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| b.1.cmp(&a.1)).then_with(|| a.0.names().cmp(&b.0.names())));

        Ok(ConsensusResult {
            name: query.name().to_string(),
            lineage,
            reason,
            total_hashes: hashes.len(),
            assigned_hashes: candidates.len(),
            hash_counts,
            support,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sketch::HashSketch;

    pub(crate) fn lin(pairs: &[(Rank, &str)]) -> Lineage {
        Lineage::from_pairs(pairs.iter().map(|&(r, n)| LineagePair::new(r, n)).collect())
    }

    fn lineage_c() -> Lineage {
        lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B"), (Rank::Genus, "C")])
    }

    fn lineage_d() -> Lineage {
        lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B"), (Rank::Genus, "D")])
    }

    /// Index where hashes 1..=n_c map to C and the next n_d hashes map to D.
    fn c_d_database(n_c: u64, n_d: u64) -> LcaDatabase {
        let mut db = LcaDatabase::new(31, 1);
        for h in 1..=n_c {
            db.assign(h, lineage_c());
        }
        for h in n_c + 1..=n_c + n_d {
            db.assign(h, lineage_d());
        }
        db
    }

    fn query(n: u64) -> HashSketch {
        HashSketch::new("query", 31, 1, 1..=n + 100)
    }

    #[test]
    fn test_below_threshold_branch_is_pruned() {
        // 6 hashes -> C, 4 -> D, threshold 5: only C votes
        let dbs = vec![c_d_database(6, 4)];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let result = classifier.classify(&query(10)).unwrap();

        assert_eq!(result.lineage, lineage_c());
        assert_eq!(result.reason, 0);
        assert_eq!(result.assigned_hashes, 10);
        assert_eq!(result.total_hashes, 110);
    }

    #[test]
    fn test_split_support_stops_at_branch() {
        // 6 -> C, 5 -> D: both pass, the confirmed tree branches at B
        let dbs = vec![c_d_database(6, 5)];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let result = classifier.classify(&query(11)).unwrap();

        assert_eq!(result.lineage, lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B")]));
        assert!(result.is_split());
        assert_eq!(result.reason, 2);

        let b = lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B")]);
        let support_b = result.support.iter().find(|(l, _)| *l == b).map(|(_, c)| *c);
        assert_eq!(support_b, Some(11));
        assert_eq!(
            result.to_record(),
            vec!["query", "A", "B", "", "", "", "", ""]
        );
    }

    #[test]
    fn test_per_hash_conflict_resolves_to_shared_ancestor() {
        // every hash carries both C and D: each resolves to B
        let mut db = LcaDatabase::new(31, 1);
        for h in 1..=5 {
            db.assign(h, lineage_c());
            db.assign(h, lineage_d());
        }
        let dbs = vec![db];
        let result = ConsensusClassifier::new(&dbs, 5).unwrap().classify(&query(5)).unwrap();
        assert_eq!(result.lineage, lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B")]));
        assert_eq!(result.reason, 0);
        assert_eq!(result.hash_counts, vec![(result.lineage.clone(), 5)]);
    }

    #[test]
    fn test_candidates_gathered_across_databases() {
        let mut db1 = LcaDatabase::new(31, 1);
        let mut db2 = LcaDatabase::new(31, 1);
        for h in 1..=5 {
            db1.assign(h, lineage_c());
            db2.assign(h, lineage_d());
        }
        let dbs = vec![db1, db2];
        let result = ConsensusClassifier::new(&dbs, 5).unwrap().classify(&query(5)).unwrap();
        assert_eq!(result.lineage.names(), vec!["A", "B"]);
    }

    #[test]
    fn test_no_hits_gives_blank_row() {
        let dbs = vec![c_d_database(6, 4)];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let miss = HashSketch::new("nothing", 31, 1, 1000..1100);
        let result = classifier.classify(&miss).unwrap();

        assert!(result.lineage.is_empty());
        assert_eq!(result.assigned_hashes, 0);
        assert_eq!(result.to_record(), vec!["nothing", "", "", "", "", "", "", ""]);
    }

    #[test]
    fn test_sparse_lineage_lands_in_rank_columns() {
        let dbs = vec![c_d_database(6, 0)];
        let result = ConsensusClassifier::new(&dbs, 5).unwrap().classify(&query(6)).unwrap();
        assert_eq!(result.to_record(), vec!["query", "A", "B", "", "", "", "C", ""]);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let dbs = vec![c_d_database(7, 6)];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let q = query(13);
        let first = classifier.classify(&q).unwrap();
        let second = classifier.classify(&q).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_record(), second.to_record());
    }

    #[test]
    fn test_raising_threshold_on_single_chain_never_deepens() {
        // 8 hashes at C, 3 more only known down to B
        let mut db = c_d_database(8, 0);
        for h in 9..=11 {
            db.assign(h, lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B")]));
        }
        let dbs = vec![db];
        let q = query(11);

        let mut last_depth = usize::MAX;
        for threshold in [1, 3, 4, 8, 9, 20] {
            let result = ConsensusClassifier::new(&dbs, threshold).unwrap().classify(&q).unwrap();
            assert!(result.lineage.len() <= last_depth, "threshold {threshold}");
            last_depth = result.lineage.len();
        }
        assert_eq!(last_depth, 0);
    }

    #[test]
    fn test_root_lineage_votes_do_not_hide_taxa() {
        let mut db = c_d_database(6, 0);
        for h in 7..=12 {
            db.assign(h, Lineage::new());
        }
        let dbs = vec![db];
        let result = ConsensusClassifier::new(&dbs, 5).unwrap().classify(&query(12)).unwrap();
        assert_eq!(result.lineage, lineage_c());
    }

    #[test]
    fn test_incompatible_databases() {
        let dbs = vec![LcaDatabase::new(31, 10), LcaDatabase::new(21, 10)];
        assert!(matches!(
            ConsensusClassifier::new(&dbs, 5),
            Err(LcaError::IncompatibleDatabases(_))
        ));
        let dbs = vec![LcaDatabase::new(31, 10), LcaDatabase::new(31, 100)];
        assert!(ConsensusClassifier::new(&dbs, 5).is_err());
        assert!(ConsensusClassifier::new(&[], 5).is_err());
    }

    #[test]
    fn test_query_downsampled_to_database_scaled() {
        let mut db = LcaDatabase::new(31, 10);
        for h in (10..=60).step_by(10) {
            db.assign(h, lineage_c());
        }
        let dbs = vec![db];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();

        let fine = HashSketch::new("fine", 31, 5, (5..=60).step_by(5));
        let result = classifier.classify(&fine).unwrap();
        assert_eq!(result.total_hashes, 6);
        assert_eq!(result.lineage, lineage_c());

        // a multiple of the database factor is used as-is
        let coarse = HashSketch::new("coarse", 31, 20, [20, 40, 60, 80]);
        let result = classifier.classify(&coarse).unwrap();
        assert_eq!(result.total_hashes, 4);
        assert_eq!(result.assigned_hashes, 3);

        let odd = HashSketch::new("odd", 31, 15, [15, 30, 45, 60]);
        assert!(matches!(
            classifier.classify(&odd),
            Err(LcaError::ScaledMismatch { current: 15, requested: 10, .. })
        ));
    }
}
