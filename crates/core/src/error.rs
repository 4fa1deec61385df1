//! Error taxonomy for the core crate boundary.
//!
//! Kinds mirror the propagation policy: transient resource issues and
//! per-file parse/embed failures are recovered locally (see
//! `indexer` and `embed`); everything else bubbles up through these
//! variants with a stable `.code()` string callers can match on.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no index found at {path}")]
    IndexNotFound { path: PathBuf },

    #[error("stored schema version {stored} is newer than supported version {supported}")]
    SchemaMismatch { stored: u32, supported: u32 },

    #[error("embedder dimension {got} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Vector store ran out of reserved capacity. Recovered locally by the
    /// store (reserve-and-retry); this variant should never cross the
    /// orchestrator boundary in normal operation.
    #[error("vector store capacity exhausted (capacity={capacity})")]
    CapacityExhausted { capacity: usize },

    #[error("failed to parse {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("embedder unavailable: {reason}")]
    EmbedderUnavailable { reason: String },

    #[error("store I/O error: {0}")]
    StoreIoError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("checksum mismatch reading {path}: index is corrupt and marked read-only")]
    ChecksumError { path: PathBuf },
}

impl CoreError {
    /// Stable machine-readable tag for callers that branch on error kind
    /// instead of matching the enum directly (e.g. across an FFI or RPC
    /// boundary).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::IndexNotFound { .. } => "index_not_found",
            CoreError::SchemaMismatch { .. } => "schema_mismatch",
            CoreError::DimensionMismatch { .. } => "dimension_mismatch",
            CoreError::CapacityExhausted { .. } => "capacity_exhausted",
            CoreError::ParseError { .. } => "parse_error",
            CoreError::EmbedderUnavailable { .. } => "embedder_unavailable",
            CoreError::StoreIoError(_) => "store_io_error",
            CoreError::Cancelled => "cancelled",
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::ChecksumError { .. } => "checksum_error",
        }
    }

    /// Whether this error is fatal to an in-progress indexing pass (as
    /// opposed to being collected per-file and continued past).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::SchemaMismatch { .. }
                | CoreError::DimensionMismatch { .. }
                | CoreError::ChecksumError { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::StoreIoError(e.to_string())
    }
}

impl From<tantivy::TantivyError> for CoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        CoreError::StoreIoError(e.to_string())
    }
}

impl From<heed::Error> for CoreError {
    fn from(e: heed::Error) -> Self {
        CoreError::StoreIoError(e.to_string())
    }
}

impl From<arroy::Error> for CoreError {
    fn from(e: arroy::Error) -> Self {
        CoreError::StoreIoError(e.to_string())
    }
}
