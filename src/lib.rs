// src/lib.rs
pub mod types;
pub mod error;
pub mod files;
pub mod taxdb;
pub mod sketch;
pub mod accessions;
pub mod lca_db;
pub mod builder;
pub mod classify;
pub mod reconcile;
pub mod gather;

use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::accessions::AccessionTable;
use crate::builder::{BuildOptions, BuildStats, IndexBuilder};
use crate::classify::{
    build_lineage_report, classify_sketches_parallel, render_lineage_report, write_classifications,
    BatchSummary, ConsensusClassifier, ConsensusResult,
};
use crate::error::Result;
use crate::gather::{read_gather_names, resolve_match_lineages, MatchLineage};
use crate::lca_db::{relative_to, LcaDatabase, LcaManifest, ManifestEntry};
use crate::reconcile::{read_lineage_spreadsheet, AmbiguousNames, LineageReconciler, ReconciliationReport};
use crate::sketch::{load_sketches, HashSketch};
use crate::taxdb::TaxonomyTree;
use crate::types::{LineageReportRow, Rank};

/// Where the taxonomy comes from.
#[derive(Debug, Clone)]
pub enum TaxonomySource {
    /// NCBI `nodes.dmp` + `names.dmp`
    Dmp { nodes: PathBuf, names: PathBuf },
    /// Single-file `taxDB`
    TaxDb(PathBuf),
}

impl TaxonomySource {
    pub fn load(&self) -> Result<TaxonomyTree> {
        match self {
            TaxonomySource::Dmp { nodes, names } => TaxonomyTree::load(nodes, names),
            TaxonomySource::TaxDb(path) => TaxonomyTree::from_taxdb(path),
        }
    }
}

/// What to do with the hash -> taxon-set checkpoint during a build.
#[derive(Debug, Clone, Default)]
pub enum Checkpoint {
    #[default]
    Off,
    /// Scan sketches, then write the checkpoint here.
    Save(PathBuf),
    /// Skip the sketch scan and start from this checkpoint.
    Load(PathBuf),
}

/// Loads every sketch of `ksize` from a list of signature files.
pub fn load_sketch_files(paths: &[PathBuf], ksize: u32) -> Result<Vec<HashSketch>> {
    let mut sketches = Vec::new();
    for path in paths {
        sketches.extend(load_sketches(path, ksize)?);
    }
    log::info!("Loaded {} sketches from {} file(s)", sketches.len(), paths.len());
    Ok(sketches)
}

/// Builds an LCA index from labeled sketches.
pub fn build_database(
    taxonomy: &TaxonomyTree,
    accessions_path: &Path,
    sketch_paths: &[PathBuf],
    options: BuildOptions,
    checkpoint: &Checkpoint,
) -> Result<(LcaDatabase, BuildStats)> {
    let accessions = AccessionTable::load(accessions_path)?;
    let ksize = options.ksize;
    let mut builder = IndexBuilder::new(taxonomy, &accessions, options);

    match checkpoint {
        Checkpoint::Load(path) => builder.load_checkpoint(path)?,
        Checkpoint::Off | Checkpoint::Save(_) => {
            let sketches = load_sketch_files(sketch_paths, ksize)?;
            builder.add_sketches(&sketches)?;
            if let Checkpoint::Save(path) = checkpoint {
                builder.save_checkpoint(path)?;
            }
        }
    }

    Ok(builder.finish())
}

/// Adds (or creates) a manifest entry pointing at `db_path` and its taxonomy.
/// Stored paths are relative to the manifest's directory when possible.
pub fn register_in_manifest(
    manifest_path: &Path,
    db: &LcaDatabase,
    db_path: &Path,
    nodes: &Path,
    names: &Path,
) -> Result<()> {
    let mut manifest = if manifest_path.exists() {
        LcaManifest::load(manifest_path)?
    } else {
        LcaManifest::new()
    };
    let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));
    manifest.add_db(ManifestEntry {
        ksize: db.ksize,
        scaled: db.scaled,
        lca_db: relative_to(db_path, base),
        nodes: relative_to(nodes, base),
        names: relative_to(names, base),
    });
    manifest.save(manifest_path)?;
    log::info!("registered ksize={} database in {}", db.ksize, manifest_path.display());
    Ok(())
}

pub fn load_databases(paths: &[PathBuf]) -> Result<Vec<LcaDatabase>> {
    paths.iter().map(LcaDatabase::load).collect()
}

/// Classifications of a batch of query sketches, plus optional per-query reports.
pub struct ClassificationResults {
    pub results: Vec<ConsensusResult>,
    pub summary: BatchSummary,
    /// One report per entry of `results`, when requested.
    pub report_rows: Option<Vec<Vec<LineageReportRow>>>,
}

impl ClassificationResults {
    /// Generate the classification CSV on demand
    pub fn get_classification_csv(&self) -> Result<String> {
        let mut out = Vec::new();
        write_classifications(&mut out, &self.results)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Generate the per-query reports on demand
    pub fn get_report(&self) -> Option<String> {
        let rows = self.report_rows.as_ref()?;
        let mut output = String::new();
        for (result, rows) in self.results.iter().zip(rows) {
            writeln!(output, "# {}", result.name).unwrap();
            output.push_str(&render_lineage_report(rows));
        }
        Some(output)
    }
}

/// Classifies every `ksize` sketch in `query_paths` against `databases`.
pub fn classify_sketch_files(
    databases: &[LcaDatabase],
    query_paths: &[PathBuf],
    ksize: u32,
    threshold: u32,
    generate_report: bool,
) -> Result<ClassificationResults> {
    let classifier = ConsensusClassifier::new(databases, threshold)?;
    let queries = load_sketch_files(query_paths, ksize)?;
    let (results, summary) = classify_sketches_parallel(&classifier, &queries);

    let report_rows = generate_report.then(|| {
        results
            .iter()
            .map(|r| build_lineage_report(&r.hash_counts, r.total_hashes))
            .collect()
    });

    Ok(ClassificationResults {
        results,
        summary,
        report_rows,
    })
}

pub fn reconcile_spreadsheet(
    taxonomy: &TaxonomyTree,
    spreadsheet: &Path,
    ambiguous: AmbiguousNames,
    header_tolerance: usize,
) -> Result<ReconciliationReport> {
    let rows = read_lineage_spreadsheet(spreadsheet, header_tolerance)?;
    let reconciler = LineageReconciler::new(taxonomy).with_ambiguous_names(ambiguous);
    Ok(reconciler.reconcile_rows(&rows))
}

/// Resolves every match name of a gather CSV to a fixed-rank lineage.
pub fn gather_to_lineage(
    taxonomy: &TaxonomyTree,
    accessions_path: &Path,
    gather_csv: &Path,
) -> Result<Vec<MatchLineage>> {
    let accessions = AccessionTable::load(accessions_path)?;
    let names = read_gather_names(gather_csv)?;
    Ok(resolve_match_lineages(
        taxonomy,
        &accessions,
        names.iter().map(String::as_str),
    ))
}

/// ksize -> (rank -> hashes resolving to that rank).
pub type RankSummary = BTreeMap<u32, BTreeMap<Rank, u64>>;

pub fn summarize_databases(databases: &[LcaDatabase]) -> RankSummary {
    let mut summary = RankSummary::new();
    for db in databases {
        let counts = summary.entry(db.ksize).or_default();
        for (rank, n) in db.rank_counts() {
            *counts.entry(rank).or_insert(0) += n;
        }
    }
    summary
}

/// `rank, <ksize>...` table with one row per fixed rank.
pub fn write_rank_summary<W: Write>(writer: W, summary: &RankSummary) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut header = vec!["rank".to_string()];
    header.extend(summary.keys().map(|k| k.to_string()));
    csv_writer.write_record(&header)?;

    for rank in Rank::FIXED {
        let mut row = vec![rank.as_str().to_string()];
        row.extend(
            summary
                .values()
                .map(|counts| counts.get(&rank).copied().unwrap_or(0).to_string()),
        );
        csv_writer.write_record(&row)?;
    }
    csv_writer.flush()?;
    Ok(())
}
