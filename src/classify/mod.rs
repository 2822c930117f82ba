pub mod classify_sketch;
pub mod classify_sketches;
pub mod classify_stats;
pub mod lineage_tree;

pub use classify_sketch::{ConsensusClassifier, ConsensusResult, DEFAULT_THRESHOLD};
pub use classify_sketches::{classify_sketches_parallel, save_classifications, write_classifications, BatchSummary};
pub use classify_stats::{build_lineage_report, render_lineage_report};
