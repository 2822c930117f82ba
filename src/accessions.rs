//src/accessions.rs

use ahash::AHashMap;
use std::path::Path;

use crate::error::{LcaError, Result};
use crate::files::open_reader;
use crate::types::TaxId;

/// Canonical accession key for a sketch or table name:
///  1. first whitespace-delimited token ("GCF_000005845.2 Escherichia coli" -> "GCF_000005845.2")
///  2. leading RefSeq "NZ_" record prefix removed ("NZ_CP009072.1" -> "CP009072.1")
///  3. version suffix dropped at the first '.' ("CP009072.1" -> "CP009072")
///
/// Table keys and sketch names both go through this function, so a table
/// listing "NZ_CP009072.1" still matches a sketch named "CP009072".
pub fn normalize_accession(name: &str) -> &str {
    let acc = name.split_whitespace().next().unwrap_or("");
    let acc = acc.strip_prefix("NZ_").unwrap_or(acc);
    acc.split('.').next().unwrap_or(acc)
}

/// accession -> taxid, keyed by `normalize_accession`.
#[derive(Debug, Default, Clone)]
pub struct AccessionTable {
    entries: AHashMap<String, TaxId>,
}

impl AccessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, accession: &str, taxid: TaxId) {
        self.entries.insert(normalize_accession(accession).to_string(), taxid);
    }

    /// Loads an `accession,taxid[,...]` CSV (optionally gzipped); columns past
    /// the taxid are ignored. A leading header row starting with
    /// "acc"/"accession" is skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(open_reader(path)?);

        let mut table = Self::new();
        for (n, record) in reader.records().enumerate() {
            let record = record?;
            let acc = record.get(0).unwrap_or("").trim();
            if n == 0 && (acc.eq_ignore_ascii_case("acc") || acc.eq_ignore_ascii_case("accession")) {
                continue;
            }
            if record.len() < 2 || acc.is_empty() {
                return Err(LcaError::MalformedRecord {
                    path: path.display().to_string(),
                    line: n + 1,
                    reason: format!("expected accession,taxid[,lineage], found {} fields", record.len()),
                });
            }
            let taxid: TaxId = record[1].trim().parse().map_err(|_| LcaError::MalformedRecord {
                path: path.display().to_string(),
                line: n + 1,
                reason: format!("bad taxid {:?}", &record[1]),
            })?;
            table.insert(acc, taxid);
        }

        log::info!("Loaded {} accessions from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a raw sketch/accession name after normalization.
    pub fn get_taxid(&self, name: &str) -> Option<TaxId> {
        self.entries.get(normalize_accession(name)).copied()
    }
}
