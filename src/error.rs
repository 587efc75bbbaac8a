//! Domain error kinds for the ingestion engine and storage substrate.

use std::path::PathBuf;

/// Errors raised by the manifest, writer, reader, ingestor, and orchestrator.
///
/// `RateLimit` and `Transient` are recovered internally by the ingestor's
/// bounded retry loops (see `ingestor.rs`) and only surface here once the
/// retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum LakeError {
    #[error("rate limited by venue")]
    RateLimit,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("symbol {symbol} not found on {exchange}")]
    SymbolUnknown { exchange: String, symbol: String },

    #[error("could not parse {field}: {value}")]
    ParseError { field: &'static str, value: String },

    #[error("write integrity check failed for {path}: {reason}")]
    WriteIntegrity { path: PathBuf, reason: String },

    #[error("source file not found: {0}")]
    MissingSource(PathBuf),

    #[error("no data available for {exchange} {symbol}")]
    NoDataAvailable { exchange: String, symbol: String },

    /// Never constructed: a duplicate `path` on insert is resolved by
    /// upsert (§3.1 I1), not treated as an error. Kept so the full set of
    /// error kinds named in the design is visible at the type level.
    #[error("catalog conflict on path {0}")]
    CatalogConflict(PathBuf),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Polars(#[from] polars::error::PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, LakeError>;
