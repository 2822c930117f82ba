//src/gather.rs

use std::io::Write;
use std::path::Path;

use crate::accessions::{normalize_accession, AccessionTable};
use crate::error::{LcaError, Result};
use crate::files::open_reader;
use crate::taxdb::TaxonomyTree;
use crate::types::{Lineage, TaxId};

/// A gather match name resolved to a taxon through the accession table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchLineage {
    pub name: String,
    pub accession: String,
    /// `None` when the accession is not in the table
    pub taxid: Option<TaxId>,
    pub lineage: Lineage,
}

/// Reads the `name` column of a gather CSV (optionally gzipped).
pub fn read_gather_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_reader(open_reader(path)?);
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == "name")
        .ok_or_else(|| LcaError::MalformedRecord {
            path: path.display().to_string(),
            line: 1,
            reason: "no 'name' column in header".to_string(),
        })?;

    let mut names = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(name) = record.get(column) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Maps each match name to its accession, taxid and fixed-rank lineage.
/// Input order is preserved; unknown accessions keep an empty lineage.
pub fn resolve_match_lineages<'n, I>(
    taxonomy: &TaxonomyTree,
    accessions: &AccessionTable,
    names: I,
) -> Vec<MatchLineage>
where
    I: IntoIterator<Item = &'n str>,
{
    names
        .into_iter()
        .map(|name| {
            let accession = normalize_accession(name).to_string();
            let taxid = accessions.get_taxid(&accession);
            let lineage = match taxid {
                Some(taxid) => {
                    let lineage = taxonomy.lineage_of(taxid, None);
                    log::info!("For {accession}, found lineage {lineage}");
                    lineage
                }
                None => {
                    log::warn!("accession {accession} not found; no lineage for {name}");
                    Lineage::new()
                }
            };
            MatchLineage {
                name: name.to_string(),
                accession,
                taxid,
                lineage,
            }
        })
        .collect()
}

/// Writes a `name,lineage` row for every resolved match; returns the row count.
pub fn write_match_lineages<W: Write>(writer: W, matches: &[MatchLineage]) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(["name", "lineage"])?;
    let mut written = 0;
    for m in matches.iter().filter(|m| m.taxid.is_some()) {
        csv_writer.write_record([m.name.as_str(), m.lineage.to_string().as_str()])?;
        written += 1;
    }
    csv_writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxdb::tests::sample_tree;

    fn write_gather_csv(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("gather.csv");
        std::fs::write(
            &path,
            "intersect_bp,f_orig_query,f_match,name\n\
             500000,0.4,0.9,NZ_CP009072.1 Escherichia coli ATCC 25922\n\
             120000,0.1,0.2,GCF_999999999.1 mystery genome\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_known_and_unknown_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gather_csv(dir.path());
        let tree = sample_tree();
        let mut acc = AccessionTable::new();
        acc.insert("CP009072.1", 562);

        let names = read_gather_names(&path).unwrap();
        let matches = resolve_match_lineages(&tree, &acc, names.iter().map(String::as_str));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].accession, "CP009072");
        assert_eq!(matches[0].taxid, Some(562));
        assert_eq!(matches[0].lineage, tree.lineage_of(562, None));
        assert_eq!(matches[1].taxid, None);
        assert!(matches[1].lineage.is_empty());

        let mut out = Vec::new();
        assert_eq!(write_match_lineages(&mut out, &matches).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "name,lineage");
        assert_eq!(
            lines[1],
            "NZ_CP009072.1 Escherichia coli ATCC 25922,\
             Bacteria;Proteobacteria;Gammaproteobacteria;Enterobacterales;Enterobacteriaceae;Escherichia;Escherichia coli"
        );
    }

    #[test]
    fn test_gather_csv_without_name_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gather.csv");
        std::fs::write(&path, "intersect_bp,match\n1000,GCF_1\n").unwrap();
        assert!(matches!(read_gather_names(&path), Err(LcaError::MalformedRecord { line: 1, .. })));
    }
}
