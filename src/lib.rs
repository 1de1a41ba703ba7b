// Registry Ingest - Core Library
// Streams ABR bulk extract XML into a normalized relational store.
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod error;
pub mod node;
pub mod normalizer;
pub mod persister;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod record;
pub mod store;
pub mod stream;

// Re-export commonly used types
pub use config::{IngestConfig, SamplingConfig, DEFAULT_BATCH_SIZE, DEFAULT_SAMPLE_SIZE};
pub use error::{IngestError, StoreError};
pub use node::{RecordNode, XmlElement};
pub use normalizer::{normalize, try_normalize, NormalizeError};
pub use persister::{BatchPersister, BatchReport, BatchRows, PersistStep, PersistSummary};
pub use pipeline::{discover_xml_files, BatchFailure, DocumentFailure, Pipeline, RunSummary};
pub use progress::{
    LogProgress, NoProgress, ProgressEvent, ProgressSink, SharedSink, SinkHandle, SkipReason,
};
pub use record::{
    normalize_abn, AbnIdentity, AlternateName, BusinessAddress, ConcessionEntry,
    IndividualName, NormalizedRecord, OrganizationName, TaxRegistration,
};
pub use store::{setup_database, MemoryStore, Row, SqliteStore, Table, TableStore};
pub use stream::{
    open_document, process_document, process_file, DocumentResult, RecordStream, StreamOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
