//src/lca_db.rs

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{LcaError, Result};
use crate::files::{create_writer, open_reader};
use crate::types::{Lineage, LineagePair, Rank};

/// Document type tag for persisted LCA databases.
pub const DATABASE_FILE_TYPE: &str = "sketch_lca";

/// Persisted database format version.
pub const DATABASE_VERSION: &str = "1.0";

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

pub type LineageId = u32;

/// A hash value -> lineage index at one (ksize, scaled).
///
/// Lineages are interned: identical lineages share one id, and hashes point at
/// ids. A single-taxon build stores one id per hash; a multi-lineage build may
/// store several.
#[derive(Debug, Clone, Default)]
pub struct LcaDatabase {
    pub ksize: u32,
    pub scaled: u64,
    lineages: AHashMap<LineageId, Lineage>,
    lineage_ids: AHashMap<Lineage, LineageId>,
    hashval_assignments: AHashMap<u64, Vec<LineageId>>,
    next_id: LineageId,
}

/// On-disk layout of an `LcaDatabase`.
#[derive(Serialize, Deserialize)]
struct LcaDatabaseDoc {
    version: String,
    #[serde(rename = "type")]
    kind: String,
    ksize: u32,
    scaled: u64,
    lineages: BTreeMap<LineageId, BTreeMap<Rank, String>>,
    hashval_assignments: BTreeMap<u64, Vec<LineageId>>,
}

impl LcaDatabase {
    pub fn new(ksize: u32, scaled: u64) -> Self {
        Self {
            ksize,
            scaled,
            ..Default::default()
        }
    }

    /// Returns the id of `lineage`, adding it to the table if new.
    pub fn intern_lineage(&mut self, lineage: Lineage) -> LineageId {
        if let Some(&id) = self.lineage_ids.get(&lineage) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.lineages.insert(id, lineage.clone());
        self.lineage_ids.insert(lineage, id);
        id
    }

    /// Associates `hashval` with `lineage`; repeated assignments of the same
    /// lineage to a hash are stored once.
    pub fn assign(&mut self, hashval: u64, lineage: Lineage) {
        let id = self.intern_lineage(lineage);
        let ids = self.hashval_assignments.entry(hashval).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn lineage(&self, id: LineageId) -> Option<&Lineage> {
        self.lineages.get(&id)
    }

    /// Every lineage assigned to `hashval` (empty when unknown).
    pub fn lineages_for_hash(&self, hashval: u64) -> impl Iterator<Item = &Lineage> + '_ {
        self.hashval_assignments
            .get(&hashval)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.lineages.get(id))
    }

    pub fn contains_hash(&self, hashval: u64) -> bool {
        self.hashval_assignments.contains_key(&hashval)
    }

    pub fn hashvals(&self) -> impl Iterator<Item = u64> + '_ {
        self.hashval_assignments.keys().copied()
    }

    /// Number of hashes in the index.
    pub fn len(&self) -> usize {
        self.hashval_assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashval_assignments.is_empty()
    }

    pub fn lineage_count(&self) -> usize {
        self.lineages.len()
    }

    /// Counts, per fixed rank, the hashes whose lineage(s) end at that rank.
    /// Hashes resolved to the root (empty lineage) are not counted.
    pub fn rank_counts(&self) -> BTreeMap<Rank, u64> {
        let mut counts = BTreeMap::new();
        for ids in self.hashval_assignments.values() {
            for id in ids {
                if let Some(last) = self.lineages.get(id).and_then(Lineage::last) {
                    *counts.entry(last.rank).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Writes the database as JSON (gzipped if `path` ends in ".gz").
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let doc = LcaDatabaseDoc {
            version: DATABASE_VERSION.to_string(),
            kind: DATABASE_FILE_TYPE.to_string(),
            ksize: self.ksize,
            scaled: self.scaled,
            lineages: self
                .lineages
                .iter()
                .map(|(&id, lineage)| {
                    let by_rank: BTreeMap<Rank, String> = lineage.pairs().iter().map(|p| (p.rank, p.name.clone())).collect();
                    (id, by_rank)
                })
                .collect(),
            hashval_assignments: self
                .hashval_assignments
                .iter()
                .map(|(&h, ids)| (h, ids.clone()))
                .collect(),
        };

        let mut writer = create_writer(&path)?;
        serde_json::to_writer(&mut writer, &doc)?;
        writer.flush()?;
        log::info!(
            "Saved LCA database ({} hashes, {} lineages) to {}",
            self.len(),
            self.lineage_count(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Loads and validates a database written by `save`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let doc: LcaDatabaseDoc = serde_json::from_reader(open_reader(path)?)?;

        if doc.kind != DATABASE_FILE_TYPE {
            return Err(LcaError::UnsupportedFormat(format!(
                "{}: database type {:?}, expected {:?}",
                path.display(),
                doc.kind,
                DATABASE_FILE_TYPE
            )));
        }
        if doc.version != DATABASE_VERSION {
            return Err(LcaError::UnsupportedFormat(format!(
                "{}: database version {}, expected {}",
                path.display(),
                doc.version,
                DATABASE_VERSION
            )));
        }

        let mut db = Self::new(doc.ksize, doc.scaled);
        for (id, by_rank) in doc.lineages {
            // BTreeMap<Rank, _> iterates in rank order, i.e. root to leaf
            let lineage = Lineage::from_pairs(
                by_rank
                    .into_iter()
                    .filter(|(_, name)| !name.is_empty())
                    .map(|(rank, name)| LineagePair::new(rank, name))
                    .collect(),
            );
            db.lineage_ids.insert(lineage.clone(), id);
            db.lineages.insert(id, lineage);
            db.next_id = db.next_id.max(id + 1);
        }
        for (hashval, ids) in doc.hashval_assignments {
            if let Some(bad) = ids.iter().find(|id| !db.lineages.contains_key(id)) {
                return Err(LcaError::UnsupportedFormat(format!(
                    "{}: hash {} refers to unknown lineage id {}",
                    path.display(),
                    hashval,
                    bad
                )));
            }
            db.hashval_assignments.insert(hashval, ids);
        }

        log::info!(
            "Loaded LCA database with {} hashes, {} lineages, ksize={}, scaled={}",
            db.len(),
            db.lineage_count(),
            db.ksize,
            db.scaled
        );
        Ok(db)
    }
}

/// One database entry of a manifest. Paths are relative to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub ksize: u32,
    pub scaled: u64,
    pub lca_db: String,
    pub nodes: String,
    pub names: String,
}

/// Groups LCA databases for several k-sizes with the taxonomy files they assume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcaManifest {
    pub version: u32,
    pub dblist: Vec<ManifestEntry>,
    #[serde(skip)]
    basepath: PathBuf,
}

impl Default for LcaManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            dblist: Vec::new(),
            basepath: PathBuf::new(),
        }
    }
}

impl LcaManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut manifest: LcaManifest = serde_json::from_reader(open_reader(path)?)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(LcaError::UnsupportedFormat(format!(
                "{}: manifest version {}",
                path.display(),
                manifest.version
            )));
        }
        manifest.basepath = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(manifest)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = create_writer(path)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn add_db(&mut self, entry: ManifestEntry) {
        self.dblist.push(entry);
    }

    /// The single entry for `ksize`.
    pub fn get_entry(&self, ksize: u32) -> Result<&ManifestEntry> {
        let matching: Vec<&ManifestEntry> = self.dblist.iter().filter(|e| e.ksize == ksize).collect();
        match matching.len() {
            0 => Err(LcaError::DatabaseNotFound(ksize)),
            1 => Ok(matching[0]),
            count => Err(LcaError::MultipleDatabases { ksize, count }),
        }
    }

    /// Resolves a manifest-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.basepath.join(relative)
    }

    /// Loads the taxonomy and index registered for `ksize`.
    pub fn get_database(&self, ksize: u32) -> Result<(crate::taxdb::TaxonomyTree, LcaDatabase)> {
        let entry = self.get_entry(ksize)?;
        log::info!("loading taxonomic nodes from {}", entry.nodes);
        let taxonomy = crate::taxdb::TaxonomyTree::load(self.resolve(&entry.nodes), self.resolve(&entry.names))?;
        log::info!("loading LCA database from {}", entry.lca_db);
        let db = LcaDatabase::load(self.resolve(&entry.lca_db))?;
        Ok((taxonomy, db))
    }
}

/// Path of `target` relative to `base_dir` when it lies under it.
pub fn relative_to(target: &Path, base_dir: &Path) -> String {
    target
        .strip_prefix(base_dir)
        .unwrap_or(target)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lineage(pairs: &[(Rank, &str)]) -> Lineage {
        Lineage::from_pairs(pairs.iter().map(|&(r, n)| LineagePair::new(r, n)).collect())
    }

    fn sample_db() -> LcaDatabase {
        let ecoli = lineage(&[(Rank::Superkingdom, "Bacteria"), (Rank::Genus, "Escherichia")]);
        let bact = lineage(&[(Rank::Superkingdom, "Bacteria")]);
        let mut db = LcaDatabase::new(31, 10);
        db.assign(10, ecoli.clone());
        db.assign(20, ecoli.clone());
        db.assign(30, bact.clone());
        db.assign(30, ecoli.clone());
        db.assign(30, bact);
        db.assign(40, Lineage::new());
        db
    }

    #[test]
    fn test_lineages_are_interned() {
        let db = sample_db();
        assert_eq!(db.lineage_count(), 3);
        assert_eq!(db.len(), 4);
        assert_eq!(db.lineages_for_hash(30).count(), 2);
        assert_eq!(db.lineages_for_hash(99).count(), 0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_db();
        for name in ["db.lca.json", "db.lca.json.gz"] {
            let path = dir.path().join(name);
            db.save(&path).unwrap();
            let loaded = LcaDatabase::load(&path).unwrap();

            assert_eq!(loaded.ksize, 31);
            assert_eq!(loaded.scaled, 10);
            assert_eq!(loaded.len(), db.len());
            for h in db.hashvals() {
                let before: Vec<&Lineage> = db.lineages_for_hash(h).collect();
                let after: Vec<&Lineage> = loaded.lineages_for_hash(h).collect();
                assert_eq!(before, after, "hash {h}");
            }
        }
    }

    #[test]
    fn test_load_rejects_wrong_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"version": "1.0", "type": "other", "ksize": 31, "scaled": 10,
                "lineages": {}, "hashval_assignments": {}}"#,
        )
        .unwrap();
        assert!(matches!(LcaDatabase::load(&path), Err(LcaError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_rank_counts() {
        let counts = sample_db().rank_counts();
        assert_eq!(counts.get(&Rank::Genus), Some(&3));
        assert_eq!(counts.get(&Rank::Superkingdom), Some(&1));
        assert_eq!(counts.get(&Rank::Species), None);
    }

    #[test]
    fn test_manifest_select_by_ksize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genbank.lca.json");
        let mut manifest = LcaManifest::new();
        for ksize in [21, 31, 51] {
            manifest.add_db(ManifestEntry {
                ksize,
                scaled: 10000,
                lca_db: format!("genbank-k{ksize}.lca.json"),
                nodes: "genbank/nodes.dmp".into(),
                names: "genbank/names.dmp".into(),
            });
        }
        manifest.save(&path).unwrap();

        let loaded = LcaManifest::load(&path).unwrap();
        assert_eq!(loaded.get_entry(31).unwrap().lca_db, "genbank-k31.lca.json");
        assert_eq!(loaded.resolve("genbank/nodes.dmp"), dir.path().join("genbank/nodes.dmp"));
        assert!(matches!(loaded.get_entry(11), Err(LcaError::DatabaseNotFound(11))));

        let mut dup = loaded.clone();
        dup.add_db(loaded.dblist[0].clone());
        assert!(matches!(dup.get_entry(21), Err(LcaError::MultipleDatabases { count: 2, .. })));
    }
}
