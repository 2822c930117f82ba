//src/error.rs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LcaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{path}:{line}: malformed record ({reason})")]
    MalformedRecord {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("accession not found: {0}")]
    AccessionNotFound(String),

    #[error("cannot downsample {name} from scaled={current} to scaled={requested}")]
    ScaledMismatch {
        name: String,
        current: u64,
        requested: u64,
    },

    #[error("incompatible databases: {0}")]
    IncompatibleDatabases(String),

    #[error("no database in manifest for ksize={0}")]
    DatabaseNotFound(u32),

    #[error("{count} databases in manifest for ksize={ksize}")]
    MultipleDatabases { ksize: u32, count: usize },

    #[error("no signature with ksize={ksize} in {name}")]
    KsizeNotFound { name: String, ksize: u32 },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("{mismatches} spreadsheet headers disagree with the expected columns (tolerance {tolerance})")]
    HeaderMismatch { mismatches: usize, tolerance: usize },
}

pub type Result<T> = std::result::Result<T, LcaError>;
