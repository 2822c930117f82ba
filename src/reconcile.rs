//src/reconcile.rs

use ahash::AHashMap;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

use crate::error::{LcaError, Result};
use crate::files::{create_writer, open_reader};
use crate::taxdb::{NameLookup, TaxonomyTree};
use crate::types::{Lineage, LineagePair, Rank, TaxId};

/// Placeholder names that mean "no value" in lineage spreadsheets.
pub const NULL_NAMES: [&str; 3] = ["[Blank]", "na", "null"];

/// Header mismatches tolerated before a spreadsheet is rejected.
pub const DEFAULT_HEADER_TOLERANCE: usize = 2;

/// How to treat a name that matches several taxa at the same rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AmbiguousNames {
    /// Treat the name as unresolved.
    #[default]
    Unresolved,
    /// Pick the numerically lowest taxid.
    LowestTaxid,
}

/// One identifier plus its cleaned `(rank, name)` lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetRow {
    pub identifier: String,
    pub lineage: Lineage,
}

/// `(rank, name, taxid)`; `taxid` is `None` for names below the anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageTriple {
    pub rank: Rank,
    pub name: String,
    pub taxid: Option<TaxId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Anchored in the taxonomy, with an optional free-text tail.
    Clean(Vec<LineageTriple>),
    /// The lowest resolvable name is not where the top-down walk stopped.
    Confusing { matched: Vec<String>, lowest: Vec<String> },
    /// The anchored lineage does not match the row's prefix.
    Incompatible { spreadsheet: Vec<String>, ncbi: Vec<String> },
    /// No name in the row resolves.
    Unanchored,
}

/// Drops empty and placeholder names.
pub fn clean_lineage<'a, I>(pairs: I) -> Lineage
where
    I: IntoIterator<Item = (Rank, &'a str)>,
{
    Lineage::from_pairs(
        pairs
            .into_iter()
            .map(|(rank, name)| (rank, name.trim()))
            .filter(|(_, name)| !name.is_empty() && !NULL_NAMES.contains(name))
            .map(|(rank, name)| LineagePair::new(rank, name))
            .collect(),
    )
}

/// Reads an `identifier, superkingdom, ..., species` CSV (optionally gzipped).
/// The first row is the header; each column disagreeing (case-insensitively)
/// with the expected name is logged, and more than `tolerance` disagreements
/// is an error.
pub fn read_lineage_spreadsheet<P: AsRef<Path>>(path: P, tolerance: usize) -> Result<Vec<SpreadsheetRow>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(open_reader(path)?);
    let mut records = reader.records();

    let expected: Vec<&str> = std::iter::once("identifier")
        .chain(Rank::FIXED.iter().map(Rank::as_str))
        .collect();

    log::info!("examining spreadsheet headers in {}", path.display());
    if let Some(header) = records.next() {
        let header = header?;
        let mut mismatches = 0;
        for (column, value) in expected.iter().zip(header.iter()) {
            if !column.eq_ignore_ascii_case(value.trim()) {
                log::warn!("assuming {column} == {value} in spreadsheet");
                mismatches += 1;
            }
        }
        if mismatches > tolerance {
            return Err(LcaError::HeaderMismatch { mismatches, tolerance });
        }
    }

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let identifier = record.get(0).unwrap_or("").trim();
        if identifier.is_empty() {
            log::warn!(
                "{}: skipping line {} with no identifier",
                path.display(),
                record.position().map_or(0, |p| p.line())
            );
            continue;
        }
        let lineage = clean_lineage(Rank::FIXED.iter().copied().zip(record.iter().skip(1)));
        rows.push(SpreadsheetRow {
            identifier: identifier.to_string(),
            lineage,
        });
    }

    log::info!("Loaded {} spreadsheet rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Loads `identifier -> lineage` from a spreadsheet or an assignments file
/// written by `ReconciliationReport::save_assignments`.
pub fn load_assignments<P: AsRef<Path>>(path: P) -> Result<AHashMap<String, Lineage>> {
    Ok(read_lineage_spreadsheet(path, DEFAULT_HEADER_TOLERANCE)?
        .into_iter()
        .map(|row| (row.identifier, row.lineage))
        .collect())
}

/// Anchors free-text lineages in a `TaxonomyTree`.
#[derive(Debug, Clone, Copy)]
pub struct LineageReconciler<'a> {
    taxonomy: &'a TaxonomyTree,
    ambiguous: AmbiguousNames,
}

impl<'a> LineageReconciler<'a> {
    pub fn new(taxonomy: &'a TaxonomyTree) -> Self {
        Self {
            taxonomy,
            ambiguous: AmbiguousNames::default(),
        }
    }

    pub fn with_ambiguous_names(mut self, ambiguous: AmbiguousNames) -> Self {
        self.ambiguous = ambiguous;
        self
    }

    fn resolve(&self, pair: &LineagePair) -> Option<TaxId> {
        match self.taxonomy.get_taxid_for_name(&pair.name, pair.rank) {
            NameLookup::Found(taxid) => Some(taxid),
            NameLookup::NotFound => None,
            NameLookup::Ambiguous(taxa) => match self.ambiguous {
                AmbiguousNames::Unresolved => {
                    log::debug!("{pair} is ambiguous ({} taxa)", taxa.len());
                    None
                }
                AmbiguousNames::LowestTaxid => taxa.into_iter().min(),
            },
        }
    }

    /// Walks top-down, stopping at the first name that does not resolve.
    /// Returns the last resolved taxon and the unresolved remainder.
    pub fn lca_taxid_for_lineage(&self, lineage: &Lineage) -> (Option<TaxId>, Vec<LineagePair>) {
        let pairs = lineage.pairs();
        let mut anchor = None;
        for (i, pair) in pairs.iter().enumerate() {
            match self.resolve(pair) {
                Some(taxid) => anchor = Some(taxid),
                None => return (anchor, pairs[i..].to_vec()),
            }
        }
        (anchor, Vec::new())
    }

    /// Walks bottom-up to the first name that resolves. Returns it and the
    /// names below it, top-down.
    pub fn lowest_taxid_for_lineage(&self, lineage: &Lineage) -> (Option<TaxId>, Vec<LineagePair>) {
        let pairs = lineage.pairs();
        for i in (0..pairs.len()).rev() {
            if let Some(taxid) = self.resolve(&pairs[i]) {
                return (Some(taxid), pairs[i + 1..].to_vec());
            }
        }
        (None, pairs.to_vec())
    }

    pub fn reconcile_row(&self, lineage: &Lineage) -> ReconciliationOutcome {
        let (anchor, rest) = self.lca_taxid_for_lineage(lineage);
        let (lowest, _) = self.lowest_taxid_for_lineage(lineage);

        let anchor = match (anchor, lowest) {
            (None, None) => return ReconciliationOutcome::Unanchored,
            (Some(a), Some(l)) if a == l => a,
            (_, Some(l)) => return self.confusing(lineage, l),
            (Some(a), None) => a,
        };

        let ncbi = self.taxonomy.lineage_of(anchor, None);
        let ncbi_names: Vec<&str> = ncbi.names();
        let row_names = lineage.names();
        let reconstructed: Vec<&str> = ncbi_names
            .iter()
            .copied()
            .chain(rest.iter().map(|p| p.name.as_str()))
            .collect();

        if row_names != reconstructed {
            let end = ncbi_names.len().min(row_names.len());
            return ReconciliationOutcome::Incompatible {
                spreadsheet: to_strings(&row_names[..end]),
                ncbi: to_strings(&ncbi_names),
            };
        }

        let mut triples: Vec<LineageTriple> = self
            .taxonomy
            .lineage_as_taxids(anchor)
            .into_iter()
            .filter_map(|taxid| {
                let rank = self.taxonomy.rank_of(taxid)?;
                if rank == Rank::Unranked {
                    return None;
                }
                let name = self.taxonomy.name_of(taxid)?;
                Some(LineageTriple { rank, name: name.to_string(), taxid: Some(taxid) })
            })
            .collect();
        triples.extend(rest.into_iter().map(|p| LineageTriple {
            rank: p.rank,
            name: p.name,
            taxid: None,
        }));
        ReconciliationOutcome::Clean(triples)
    }

    fn confusing(&self, lineage: &Lineage, lowest: TaxId) -> ReconciliationOutcome {
        let lowest_lineage = self.taxonomy.lineage_of(lowest, None);
        let row_names = lineage.names();
        // the lowest taxon came from this row, so its name is present
        let end = lowest_lineage
            .last()
            .and_then(|last| row_names.iter().position(|n| *n == last.name))
            .map_or(row_names.len(), |i| i + 1);
        ReconciliationOutcome::Confusing {
            matched: to_strings(&row_names[..end]),
            lowest: to_strings(&lowest_lineage.names()),
        }
    }

    /// Reconciles every row; no row failure stops the rest.
    pub fn reconcile_rows(&self, rows: &[SpreadsheetRow]) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        for row in rows {
            let outcome = self.reconcile_row(&row.lineage);
            log::debug!("{}: {:?}", row.identifier, outcome);
            report.record(&row.identifier, outcome);
        }
        log::info!(
            "reconciled {} rows: {} clean, {} confusing, {} incompatible, {} unanchored",
            rows.len(),
            report.assignments.len(),
            report.confusing.values().map(Vec::len).sum::<usize>(),
            report.incompatible.values().map(Vec::len).sum::<usize>(),
            report.unanchored.len()
        );
        report
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// `(row prefix, NCBI side)` -> identifiers.
pub type LineageGroups = BTreeMap<(String, String), Vec<String>>;

#[derive(Debug, Default, Clone)]
pub struct ReconciliationReport {
    pub assignments: BTreeMap<String, Vec<LineageTriple>>,
    pub confusing: LineageGroups,
    pub incompatible: LineageGroups,
    pub unanchored: Vec<String>,
}

impl ReconciliationReport {
    pub fn record(&mut self, identifier: &str, outcome: ReconciliationOutcome) {
        match outcome {
            ReconciliationOutcome::Clean(triples) => {
                self.assignments.insert(identifier.to_string(), triples);
            }
            ReconciliationOutcome::Confusing { matched, lowest } => {
                self.confusing
                    .entry((matched.join(", "), lowest.join(", ")))
                    .or_default()
                    .push(identifier.to_string());
            }
            ReconciliationOutcome::Incompatible { spreadsheet, ncbi } => {
                self.incompatible
                    .entry((spreadsheet.join(", "), ncbi.join(", ")))
                    .or_default()
                    .push(identifier.to_string());
            }
            ReconciliationOutcome::Unanchored => self.unanchored.push(identifier.to_string()),
        }
    }

    /// Rows that were not accepted.
    pub fn n_weird(&self) -> usize {
        self.confusing.len() + self.incompatible.len() + self.unanchored.len()
    }

    /// Resolved lineage per clean identifier.
    pub fn lineages(&self) -> AHashMap<String, Lineage> {
        self.assignments
            .iter()
            .map(|(ident, triples)| {
                let pairs = triples.iter().map(|t| LineagePair::new(t.rank, t.name.clone())).collect();
                (ident.clone(), Lineage::from_pairs(pairs))
            })
            .collect()
    }

    /// Count-annotated text report, largest groups first.
    pub fn render(&self) -> String {
        fn sorted(groups: &LineageGroups) -> Vec<(&(String, String), &Vec<String>)> {
            let mut v: Vec<_> = groups.iter().collect();
            v.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
            v
        }

        let mut text = String::new();
        writeln!(text, "{} clean assignments", self.assignments.len()).unwrap();

        writeln!(text, "{} confusing lineages", self.confusing.len()).unwrap();
        for ((matched, lowest), idents) in sorted(&self.confusing) {
            writeln!(text, "  [{}] {matched}\n      lowest: {lowest}", idents.len()).unwrap();
        }

        writeln!(text, "{} incompatible lineages", self.incompatible.len()).unwrap();
        for ((spreadsheet, ncbi), idents) in sorted(&self.incompatible) {
            writeln!(text, "  [{}] {spreadsheet}\n      ncbi: {ncbi}", idents.len()).unwrap();
        }

        writeln!(text, "{} unanchored rows", self.unanchored.len()).unwrap();
        for ident in &self.unanchored {
            writeln!(text, "  {ident}").unwrap();
        }
        text
    }

    /// Writes clean assignments in the spreadsheet layout, one rank per column.
    pub fn write_assignments<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let mut header = vec!["identifier"];
        header.extend(Rank::FIXED.iter().map(Rank::as_str));
        csv_writer.write_record(&header)?;

        for (ident, lineage) in self.lineages().into_iter().collect::<BTreeMap<_, _>>() {
            let mut row = vec![ident];
            row.extend(lineage.to_columns());
            csv_writer.write_record(&row)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn save_assignments<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_assignments(create_writer(path.as_ref())?)?;
        log::info!("Wrote {} assignments to {}", self.assignments.len(), path.as_ref().display());
        Ok(())
    }
}
