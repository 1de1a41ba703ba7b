// Error types for the ingest pipeline
// Skipped records are not errors: they are counted by the stream processor and
// never leave it. Document and batch failures always reach the caller.

use thiserror::Error;

use crate::persister::PersistStep;

/// Failures raised by a persistence backend call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Row serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown column '{column}' for table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Column '{column}' is not a conflict key of table '{table}'")]
    InvalidConflictKey { table: String, column: String },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Failures surfaced by the stream processor, persister and pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Document '{source_name}' failed to parse at byte {position}: {reason}")]
    DocumentParse {
        source_name: String,
        position: u64,
        reason: String,
    },

    #[error("Batch at record offset {offset} failed during {step}: {source}")]
    BatchPersist {
        offset: usize,
        step: PersistStep,
        #[source]
        source: StoreError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IngestError {
    /// Record offset of the failed batch, if this is a persistence failure
    pub fn batch_offset(&self) -> Option<usize> {
        match self {
            IngestError::BatchPersist { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub fn is_document_failure(&self) -> bool {
        matches!(self, IngestError::DocumentParse { .. })
    }
}
