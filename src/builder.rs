//src/builder.rs

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use crate::accessions::{normalize_accession, AccessionTable};
use crate::error::{LcaError, Result};
use crate::files::{create_writer, open_reader};
use crate::lca_db::LcaDatabase;
use crate::sketch::Sketch;
use crate::taxdb::TaxonomyTree;
use crate::types::{Lineage, TaxId, ROOT_TAXID};

pub const DEFAULT_KSIZE: u32 = 31;
pub const DEFAULT_SCALED: u64 = 10000;

/// What to do with a hash whose contributing taxa only share the root.
///
/// An LCA below the root with no fixed-rank ancestor of its own (e.g.
/// "cellular organisms" for Bacteria + Archaea) has an empty lineage too, so
/// it is treated the same way and counted in `BuildStats::root_equivalent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootPolicy {
    /// Leave the hash out of the index.
    #[default]
    Drop,
    /// Keep the hash, assigned to the empty (root) lineage.
    Retain,
}

/// What to do with a sketch whose accession is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessionPolicy {
    /// Skip and count it.
    #[default]
    Lenient,
    /// Fail the build with `AccessionNotFound`.
    Strict,
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub ksize: u32,
    pub scaled: u64,
    pub root_policy: RootPolicy,
    pub accession_policy: AccessionPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            ksize: DEFAULT_KSIZE,
            scaled: DEFAULT_SCALED,
            root_policy: RootPolicy::default(),
            accession_policy: AccessionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub sketches_added: usize,
    /// sketches whose accession was not found
    pub sketches_skipped: usize,
    pub hashes_processed: usize,
    pub collapsed_to_root: usize,
    /// LCA below the root but above every fixed rank
    pub root_equivalent: usize,
    pub empty_sets: usize,
    pub hashes_indexed: usize,
}

/// hash value -> taxa of every genome containing it
pub type HashTaxonSets = AHashMap<u64, AHashSet<TaxId>>;

/// Accumulates (hash -> contributing taxa) from labeled sketches, then
/// collapses every hash to the LCA of its taxa.
pub struct IndexBuilder<'a> {
    taxonomy: &'a TaxonomyTree,
    accessions: &'a AccessionTable,
    options: BuildOptions,
    hash_to_taxids: HashTaxonSets,
    stats: BuildStats,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(taxonomy: &'a TaxonomyTree, accessions: &'a AccessionTable, options: BuildOptions) -> Self {
        Self {
            taxonomy,
            accessions,
            options,
            hash_to_taxids: HashTaxonSets::new(),
            stats: BuildStats::default(),
        }
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn hash_taxon_sets(&self) -> &HashTaxonSets {
        &self.hash_to_taxids
    }

    /// Adds one sketch. Returns `Ok(false)` when the sketch was skipped
    /// because its accession is unknown (lenient mode).
    pub fn add_sketch<S: Sketch>(&mut self, sketch: &S) -> Result<bool> {
        let acc = normalize_accession(sketch.name());
        let Some(taxid) = self.accessions.get_taxid(acc) else {
            self.stats.sketches_skipped += 1;
            return match self.options.accession_policy {
                AccessionPolicy::Strict => Err(LcaError::AccessionNotFound(acc.to_string())),
                AccessionPolicy::Lenient => {
                    log::warn!("accession {acc} not found; skipping {}", sketch.name());
                    Ok(false)
                }
            };
        };

        let sketch = sketch.downsample(self.options.scaled)?;
        for &hashval in sketch.hash_values() {
            self.hash_to_taxids.entry(hashval).or_default().insert(taxid);
        }
        self.stats.sketches_added += 1;
        Ok(true)
    }

    pub fn add_sketches<'s, S, I>(&mut self, sketches: I) -> Result<()>
    where
        S: Sketch + 's,
        I: IntoIterator<Item = &'s S>,
    {
        for sketch in sketches {
            self.add_sketch(sketch)?;
        }
        Ok(())
    }

    /// Persists the hash -> taxon-set map so a later build can skip the
    /// sketch scan.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let ordered: BTreeMap<u64, BTreeSet<TaxId>> = self
            .hash_to_taxids
            .iter()
            .map(|(&h, taxa)| (h, taxa.iter().copied().collect()))
            .collect();
        let mut writer = create_writer(&path)?;
        serde_json::to_writer(&mut writer, &ordered)?;
        writer.flush()?;
        log::info!("saved {} hashvals to {}", ordered.len(), path.as_ref().display());
        Ok(())
    }

    /// Replaces the accumulated map with a checkpoint written by `save_checkpoint`.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let ordered: BTreeMap<u64, BTreeSet<TaxId>> = serde_json::from_reader(open_reader(&path)?)?;
        self.hash_to_taxids = ordered
            .into_iter()
            .map(|(h, taxa)| (h, taxa.into_iter().collect()))
            .collect();
        log::info!("loaded {} hashvals from {}", self.hash_to_taxids.len(), path.as_ref().display());
        Ok(())
    }

    /// Collapses every hash to the LCA of its taxa and emits the index.
    pub fn finish(self) -> (LcaDatabase, BuildStats) {
        let Self {
            taxonomy,
            options,
            hash_to_taxids,
            mut stats,
            ..
        } = self;

        log::info!("finding last-common-ancestor for {} hashvals", hash_to_taxids.len());

        let mut entries: Vec<(&u64, &AHashSet<TaxId>)> = hash_to_taxids.iter().collect();
        entries.sort_unstable_by_key(|(h, _)| **h);

        let resolved: Vec<(u64, Option<TaxId>)> = entries
            .par_iter()
            .map(|&(hashval, taxa)| {
                if taxa.is_empty() {
                    (*hashval, None)
                } else {
                    (*hashval, Some(taxonomy.lca(taxa.iter().copied())))
                }
            })
            .collect();

        let mut db = LcaDatabase::new(options.ksize, options.scaled);
        let mut lineage_cache: AHashMap<TaxId, Lineage> = AHashMap::new();

        for (hashval, lca) in resolved {
            stats.hashes_processed += 1;
            let lca = match lca {
                None => {
                    stats.empty_sets += 1;
                    continue;
                }
                Some(lca) => lca,
            };

            if lca == ROOT_TAXID {
                stats.collapsed_to_root += 1;
                if options.root_policy == RootPolicy::Drop {
                    continue;
                }
            }

            let lineage = lineage_cache
                .entry(lca)
                .or_insert_with(|| {
                    if lca == ROOT_TAXID {
                        Lineage::new()
                    } else {
                        taxonomy.lineage_of(lca, None)
                    }
                })
                .clone();
            if lca != ROOT_TAXID && lineage.is_empty() {
                stats.root_equivalent += 1;
                if options.root_policy == RootPolicy::Drop {
                    continue;
                }
            }
            db.assign(hashval, lineage);
            stats.hashes_indexed += 1;
        }

        if stats.collapsed_to_root > 0 {
            log::info!("found root {} times", stats.collapsed_to_root);
        }
        if stats.root_equivalent > 0 {
            log::info!("found unranked root-equivalent LCA {} times", stats.root_equivalent);
        }
        if stats.empty_sets > 0 {
            log::info!("found empty set {} times", stats.empty_sets);
        }
        log::info!(
            "indexed {} of {} hashvals into {} lineages",
            stats.hashes_indexed,
            stats.hashes_processed,
            db.lineage_count()
        );
        (db, stats)
    }
}

/// Builds a multi-lineage index from sketches whose names carry a resolved
/// lineage (e.g. reconciled spreadsheet rows). Hashes keep every distinct
/// lineage they occur under; nothing is collapsed.
pub fn build_from_assignments<'s, S, I>(
    sketches: I,
    assignments: &AHashMap<String, Lineage>,
    ksize: u32,
    scaled: u64,
) -> Result<(LcaDatabase, BuildStats)>
where
    S: Sketch + 's,
    I: IntoIterator<Item = &'s S>,
{
    let mut db = LcaDatabase::new(ksize, scaled);
    let mut stats = BuildStats::default();

    for sketch in sketches {
        let Some(lineage) = assignments.get(sketch.name()) else {
            log::debug!("no assignment for {}", sketch.name());
            stats.sketches_skipped += 1;
            continue;
        };
        let sketch = sketch.downsample(scaled)?;
        for &hashval in sketch.hash_values() {
            db.assign(hashval, lineage.clone());
        }
        stats.sketches_added += 1;
    }

    stats.hashes_processed = db.len();
    stats.hashes_indexed = db.len();
    log::info!(
        "built multi-lineage index: {} hashvals, {} lineages from {} sketches",
        db.len(),
        db.lineage_count(),
        stats.sketches_added
    );
    Ok((db, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::HashSketch;
    use crate::taxdb::tests::sample_tree;
    use crate::types::{LineagePair, Rank};

    fn accessions() -> AccessionTable {
        let mut table = AccessionTable::new();
        table.insert("GCF_000005845.2", 562);
        table.insert("NZ_CP000001.1", 28901);
        table.insert("GCF_000009045.1", 91061);
        table.insert("GCA_000001.1", 2157);
        table
    }

    fn options(root_policy: RootPolicy) -> BuildOptions {
        BuildOptions {
            ksize: 31,
            scaled: 10,
            root_policy,
            accession_policy: AccessionPolicy::Lenient,
        }
    }

    fn sketches() -> Vec<HashSketch> {
        vec![
            HashSketch::new("GCF_000005845.2 Escherichia coli", 31, 10, [10, 20, 30, 40]),
            HashSketch::new("CP000001.3 Salmonella enterica", 31, 10, [30, 50]),
            HashSketch::new("GCF_000009045.1 Bacillus", 31, 10, [40, 60]),
            HashSketch::new("GCA_000001 Archaea", 31, 10, [60, 70]),
        ]
    }

    #[test]
    fn test_build_collapses_to_lca() {
        let tree = sample_tree();
        let acc = accessions();
        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Drop));
        builder.add_sketches(&sketches()).unwrap();
        let (db, stats) = builder.finish();

        let lineage_of = |h: u64| db.lineages_for_hash(h).next().map(|l| l.names().join(";"));
        // E. coli only
        assert_eq!(lineage_of(10).unwrap(), tree.lineage_of(562, None).names().join(";"));
        // E. coli + S. enterica -> Enterobacteriaceae
        assert_eq!(lineage_of(30).unwrap(), tree.lineage_of(543, None).names().join(";"));
        // E. coli + Bacilli -> Bacteria
        assert_eq!(lineage_of(40).unwrap(), "Bacteria");
        // Bacilli + Archaea -> root, dropped
        assert_eq!(lineage_of(60), None);

        assert_eq!(stats.sketches_added, 4);
        assert_eq!(stats.hashes_processed, 7);
        assert_eq!(stats.collapsed_to_root, 1);
        assert_eq!(stats.hashes_indexed, 6);
        assert_eq!(db.len(), 6);
    }

    #[test]
    fn test_root_policy_retain() {
        let tree = sample_tree();
        let acc = accessions();
        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Retain));
        builder.add_sketches(&sketches()).unwrap();
        let (db, stats) = builder.finish();

        assert_eq!(stats.collapsed_to_root, 1);
        assert_eq!(stats.hashes_indexed, 7);
        let root: Vec<&Lineage> = db.lineages_for_hash(60).collect();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_empty());
    }

    #[test]
    fn test_unranked_lca_follows_root_policy() {
        let tree = sample_tree();
        let mut acc = accessions();
        acc.insert("GCA_000002.1", 131567);
        let mut sketches = sketches();
        sketches.push(HashSketch::new("GCA_000002 cellular organism", 31, 10, [70]));

        // Archaea + cellular organisms -> cellular organisms, no fixed rank
        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Drop));
        builder.add_sketches(&sketches).unwrap();
        let (db, stats) = builder.finish();
        assert_eq!(stats.root_equivalent, 1);
        assert_eq!(stats.collapsed_to_root, 1);
        assert!(!db.contains_hash(70));
        assert_eq!(stats.hashes_indexed, 5);

        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Retain));
        builder.add_sketches(&sketches).unwrap();
        let (db, stats) = builder.finish();
        assert_eq!(stats.root_equivalent, 1);
        assert!(db.contains_hash(70));
        assert!(db.lineages_for_hash(70).all(|l| l.is_empty()));
        assert_eq!(stats.hashes_indexed, 7);
    }

    #[test]
    fn test_unknown_accession_is_skipped() {
        let tree = sample_tree();
        let acc = accessions();
        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Drop));
        let unknown = HashSketch::new("GCF_424242.1 mystery", 31, 10, [990, 1000]);

        assert!(!builder.add_sketch(&unknown).unwrap());
        assert_eq!(builder.stats().sketches_skipped, 1);
        let (db, stats) = builder.finish();
        assert_eq!(stats.sketches_skipped, 1);
        assert!(!db.contains_hash(990));
        assert!(!db.contains_hash(1000));
    }

    #[test]
    fn test_unknown_accession_strict() {
        let tree = sample_tree();
        let acc = accessions();
        let mut opts = options(RootPolicy::Drop);
        opts.accession_policy = AccessionPolicy::Strict;
        let mut builder = IndexBuilder::new(&tree, &acc, opts);
        let unknown = HashSketch::new("GCF_424242.1 mystery", 31, 10, [990]);

        match builder.add_sketch(&unknown) {
            Err(LcaError::AccessionNotFound(acc)) => assert_eq!(acc, "GCF_424242"),
            other => panic!("expected AccessionNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_sketches_downsampled_to_build_scaled() {
        let tree = sample_tree();
        let acc = accessions();
        let mut opts = options(RootPolicy::Drop);
        opts.scaled = 20;
        let mut builder = IndexBuilder::new(&tree, &acc, opts);
        builder.add_sketches(&sketches()[..1]).unwrap();
        let (db, _) = builder.finish();
        assert_eq!(db.scaled, 20);
        assert!(!db.contains_hash(10));
        assert!(db.contains_hash(20));
        assert!(db.contains_hash(40));
    }

    #[test]
    fn test_checkpoint_round_trip_and_empty_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.lca.hashvals");
        let tree = sample_tree();
        let acc = accessions();

        let mut builder = IndexBuilder::new(&tree, &acc, options(RootPolicy::Drop));
        builder.add_sketches(&sketches()).unwrap();
        builder.save_checkpoint(&path).unwrap();
        let (expected, _) = builder.finish();

        let mut resumed = IndexBuilder::new(&tree, &acc, options(RootPolicy::Drop));
        resumed.load_checkpoint(&path).unwrap();
        resumed.hash_to_taxids.insert(80, AHashSet::new());
        let (db, stats) = resumed.finish();

        assert_eq!(stats.empty_sets, 1);
        assert_eq!(db.len(), expected.len());
        for h in expected.hashvals() {
            let a: Vec<&Lineage> = expected.lineages_for_hash(h).collect();
            let b: Vec<&Lineage> = db.lineages_for_hash(h).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_build_from_assignments_keeps_every_lineage() {
        let mut assignments = AHashMap::new();
        let a = Lineage::from_pairs(vec![
            LineagePair::new(Rank::Superkingdom, "Bacteria"),
            LineagePair::new(Rank::Genus, "Candidatus Foo"),
        ]);
        let b = Lineage::from_pairs(vec![
            LineagePair::new(Rank::Superkingdom, "Bacteria"),
            LineagePair::new(Rank::Genus, "Candidatus Bar"),
        ]);
        assignments.insert("bin1".to_string(), a.clone());
        assignments.insert("bin2".to_string(), b.clone());

        let sketches = vec![
            HashSketch::new("bin1", 31, 10, [10, 20]),
            HashSketch::new("bin2", 31, 10, [20, 30]),
            HashSketch::new("bin3", 31, 10, [40]),
        ];
        let (db, stats) = build_from_assignments(&sketches, &assignments, 31, 10).unwrap();

        assert_eq!(stats.sketches_added, 2);
        assert_eq!(stats.sketches_skipped, 1);
        assert_eq!(db.lineages_for_hash(20).collect::<Vec<_>>(), vec![&a, &b]);
        assert_eq!(db.lineages_for_hash(30).collect::<Vec<_>>(), vec![&b]);
        assert!(!db.contains_hash(40));
    }
}
