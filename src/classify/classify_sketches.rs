// src/classify/classify_sketches.rs

use rayon::prelude::*;
use std::io::Write;
use std::path::Path;

use super::{ConsensusClassifier, ConsensusResult};
use crate::error::Result;
use crate::files::create_writer;
use crate::sketch::Sketch;

/// Per-batch tallies, merged across rayon workers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub classified: usize,
    /// Classified, but support split below the reported lineage.
    pub split: usize,
    pub unclassified: usize,
    /// Queries that could not be classified and were left out.
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, result: &ConsensusResult) {
        if result.lineage.is_empty() {
            self.unclassified += 1;
        } else {
            self.classified += 1;
            if result.is_split() {
                self.split += 1;
            }
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.classified += other.classified;
        self.split += other.split;
        self.unclassified += other.unclassified;
        self.failed += other.failed;
        self
    }

    pub fn total(&self) -> usize {
        self.classified + self.unclassified + self.failed
    }
}

/// Parallel classification of many queries; results come back in input order.
///
/// A query that fails (wrong ksize, incompatible scaled) is logged, counted in
/// `BatchSummary::failed` and left out; the rest of the batch is unaffected.
pub fn classify_sketches_parallel<S>(
    classifier: &ConsensusClassifier<'_>,
    queries: &[S],
) -> (Vec<ConsensusResult>, BatchSummary)
where
    S: Sketch + Sync,
{
    let outcomes: Vec<Result<ConsensusResult>> = queries
        .par_iter()
        .map(|query| classifier.classify(query))
        .collect();

    let summary = outcomes
        .par_iter()
        .fold(BatchSummary::default, |mut acc, outcome| {
            match outcome {
                Ok(result) => acc.record(result),
                Err(_) => acc.failed += 1,
            }
            acc
        })
        .reduce(BatchSummary::default, BatchSummary::merge);

    let mut results = Vec::with_capacity(outcomes.len());
    for (query, outcome) in queries.iter().zip(outcomes) {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => log::warn!("skipping {}: {}", query.name(), e),
        }
    }

    log::info!(
        "classified {} of {} queries ({} split, {} unclassified, {} failed)",
        summary.classified,
        summary.total(),
        summary.split,
        summary.unclassified,
        summary.failed
    );
    (results, summary)
}

/// Writes one `ID, superkingdom ... species` row per result.
pub fn write_classifications<W: Write>(writer: W, results: &[ConsensusResult]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(ConsensusResult::csv_header())?;
    for result in results {
        csv_writer.write_record(result.to_record())?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn save_classifications<P: AsRef<Path>>(path: P, results: &[ConsensusResult]) -> Result<()> {
    write_classifications(create_writer(path.as_ref())?, results)?;
    log::info!("Wrote {} classifications to {}", results.len(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_sketch::tests::lin;
    use crate::lca_db::LcaDatabase;
    use crate::sketch::HashSketch;
    use crate::types::Rank;

    fn database() -> LcaDatabase {
        let mut db = LcaDatabase::new(31, 1);
        let c = lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B"), (Rank::Genus, "C")]);
        let d = lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B"), (Rank::Genus, "D")]);
        for h in 1..=6 {
            db.assign(h, c.clone());
        }
        for h in 7..=12 {
            db.assign(h, d.clone());
        }
        db
    }

    fn queries() -> Vec<HashSketch> {
        vec![
            HashSketch::new("only_c", 31, 1, 1..=6),
            HashSketch::new("both", 31, 1, 1..=12),
            HashSketch::new("none", 31, 1, 100..=110),
        ]
    }

    #[test]
    fn test_parallel_batch_keeps_order_and_matches_serial() {
        let dbs = vec![database()];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let queries = queries();

        let (results, summary) = classify_sketches_parallel(&classifier, &queries);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["only_c", "both", "none"]);

        for (query, result) in queries.iter().zip(&results) {
            assert_eq!(&classifier.classify(query).unwrap(), result);
        }
        assert_eq!(
            summary,
            BatchSummary { classified: 2, split: 1, unclassified: 1, failed: 0 }
        );
    }

    #[test]
    fn test_write_classifications_csv() {
        let dbs = vec![database()];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let (results, _) = classify_sketches_parallel(&classifier, &queries());

        let mut out = Vec::new();
        write_classifications(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID,superkingdom,phylum,class,order,family,genus,species");
        assert_eq!(lines[1], "only_c,A,B,,,,C,");
        assert_eq!(lines[2], "both,A,B,,,,,");
        assert_eq!(lines[3], "none,,,,,,,");
    }

    #[test]
    fn test_failed_queries_do_not_sink_the_batch() {
        let mut db = LcaDatabase::new(31, 10);
        let c = lin(&[(Rank::Superkingdom, "A"), (Rank::Phylum, "B"), (Rank::Genus, "C")]);
        for h in (10..=60).step_by(10) {
            db.assign(h, c.clone());
        }
        let dbs = vec![db];
        let classifier = ConsensusClassifier::new(&dbs, 5).unwrap();
        let queries = vec![
            HashSketch::new("good", 31, 10, (10..=60).step_by(10)),
            HashSketch::new("k21", 21, 10, (10..=60).step_by(10)),
            HashSketch::new("odd_scaled", 31, 15, [15, 30, 45, 60]),
            HashSketch::new("coarse", 31, 1000, [1000, 2000]),
        ];

        let (results, summary) = classify_sketches_parallel(&classifier, &queries);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["good", "coarse"]);
        assert_eq!(results[0].lineage, c);
        assert!(results[1].lineage.is_empty());
        assert_eq!(
            summary,
            BatchSummary { classified: 1, split: 0, unclassified: 1, failed: 2 }
        );
        assert_eq!(summary.total(), 4);
    }
}
