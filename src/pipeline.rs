// Ingest pipeline
// Runs the stream processor over each file, threading the run-wide accepted
// count. Records flow straight from the stream into the batch persister, so a
// document is never held in memory whole.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::persister::{BatchPersister, PersistStep};
use crate::progress::{ProgressSink, SharedSink};
use crate::store::TableStore;
use crate::stream::{open_document, RecordStream};

/// A document that could not be read to the end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub source_name: String,
    /// Records accepted from the document before it failed; these are kept
    pub accepted_before_failure: usize,
    pub error: String,
}

/// A batch that was not fully persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// Run offset of the batch's first record
    pub offset: usize,
    pub step: Option<PersistStep>,
    pub error: String,
}

impl From<&IngestError> for BatchFailure {
    fn from(e: &IngestError) -> Self {
        let (offset, step) = match e {
            IngestError::BatchPersist { offset, step, .. } => (*offset, Some(*step)),
            _ => (0, None),
        };
        BatchFailure {
            offset,
            step,
            error: e.to_string(),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files_processed: usize,
    /// Files read without producing a single valid record
    pub files_without_records: usize,
    pub records_accepted: usize,
    pub records_skipped: usize,
    pub records_persisted: usize,
    pub batches_persisted: usize,
    pub sample_reached: bool,
    /// The run stopped at a failed batch
    pub halted: bool,
    pub document_failures: Vec<DocumentFailure>,
    pub batch_failures: Vec<BatchFailure>,
}

impl RunSummary {
    fn start() -> Self {
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            files_processed: 0,
            files_without_records: 0,
            records_accepted: 0,
            records_skipped: 0,
            records_persisted: 0,
            batches_persisted: 0,
            sample_reached: false,
            halted: false,
            document_failures: Vec::new(),
            batch_failures: Vec::new(),
        }
    }

    /// No document or batch failed
    pub fn is_success(&self) -> bool {
        self.document_failures.is_empty() && self.batch_failures.is_empty()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
    }
}

pub struct Pipeline<S: TableStore> {
    config: IngestConfig,
    persister: BatchPersister<S>,
}

impl<S: TableStore> Pipeline<S> {
    pub fn new(config: IngestConfig, store: S) -> Result<Self, IngestError> {
        config.validate()?;
        let persister = BatchPersister::new(store, &config);
        Ok(Pipeline { config, persister })
    }

    pub fn store(&self) -> &S {
        self.persister.store()
    }

    pub fn into_store(self) -> S {
        self.persister.into_store()
    }

    /// Ingest every `*.xml` file below `dir`
    pub fn run_directory(&mut self, dir: &Path, sink: &mut dyn ProgressSink) -> Result<RunSummary, IngestError> {
        let files = discover_xml_files(dir)?;
        info!(dir = %dir.display(), files = files.len(), "Found XML files");
        self.run(&files, sink)
    }

    /// Ingest `files` in order
    ///
    /// Document failures are recorded and the run moves on. A failed batch
    /// stops the run unless the config says to continue.
    pub fn run<P: AsRef<Path>>(&mut self, files: &[P], sink: &mut dyn ProgressSink) -> Result<RunSummary, IngestError> {
        let mut summary = RunSummary::start();
        let batches_before = self.persister.batches_persisted();
        let records_before = self.persister.records_persisted();

        info!(
            run_id = %summary.run_id,
            files = files.len(),
            limited = self.config.sampling.limited,
            sample_size = self.config.sampling.sample_size,
            batch_size = self.config.batch_size,
            "Starting ingest run"
        );

        for path in files {
            let path = path.as_ref();
            if self.config.sampling.is_reached(summary.records_accepted) {
                info!(
                    sample_size = self.config.sampling.sample_size,
                    "Sample size reached, skipping remaining files"
                );
                summary.sample_reached = true;
                break;
            }

            let prior = summary.records_accepted;
            let (source_name, reader) = match open_document(path) {
                Ok(opened) => opened,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Could not open XML file");
                    summary.document_failures.push(DocumentFailure {
                        source_name: path.display().to_string(),
                        accepted_before_failure: 0,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            debug!(path = %path.display(), prior, "Processing XML file");

            let shared = SharedSink::new(&mut *sink);
            let mut stream_sink = shared.handle();
            let mut persist_sink = shared.handle();
            let mut stream = RecordStream::new(reader, source_name.as_str(), prior, &self.config, &mut stream_sink);
            let persisted = self.persister.persist_all(stream.by_ref(), prior, &mut persist_sink);
            let outcome = stream.finish();

            summary.files_processed += 1;
            summary.records_accepted += outcome.accepted;
            summary.records_skipped += outcome.skipped;
            summary.sample_reached |= outcome.sample_reached;
            if let Some(failure) = outcome.failure {
                summary.document_failures.push(DocumentFailure {
                    source_name: source_name.clone(),
                    accepted_before_failure: outcome.accepted,
                    error: failure.to_string(),
                });
            }

            match persisted {
                Ok(persisted) => {
                    summary
                        .batch_failures
                        .extend(persisted.failures.iter().map(BatchFailure::from));
                }
                Err(e) => {
                    error!(source = %source_name, error = %e, "Halting run after failed batch");
                    summary.batch_failures.push(BatchFailure::from(&e));
                    summary.halted = true;
                    break;
                }
            }

            if outcome.accepted == 0 {
                warn!(source = %source_name, "No valid records found");
                summary.files_without_records += 1;
            }
        }

        summary.batches_persisted = self.persister.batches_persisted() - batches_before;
        summary.records_persisted = self.persister.records_persisted() - records_before;
        summary.finished_at = Some(Utc::now());

        info!(
            run_id = %summary.run_id,
            files = summary.files_processed,
            accepted = summary.records_accepted,
            skipped = summary.records_skipped,
            persisted = summary.records_persisted,
            document_failures = summary.document_failures.len(),
            batch_failures = summary.batch_failures.len(),
            "Ingest run finished"
        );
        Ok(summary)
    }
}

/// All `*.xml` files below `dir`, recursively, sorted by path
pub fn discover_xml_files(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    collect_xml_files(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_xml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), IngestError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_xml_files(&path, files)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
        {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use crate::error::StoreError;
    use crate::progress::{NoProgress, ProgressEvent};
    use crate::store::{MemoryStore, Row, Table};
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn record_xml(abn: &str) -> String {
        format!(
            r#"<ABR recordLastUpdatedDate="20240101"><ABN status="ACT" ABNStatusFromDate="20000101">{abn}</ABN><EntityType><EntityTypeInd>PRV</EntityTypeInd></EntityType><MainEntity><NonIndividualName type="MN"><NonIndividualNameText>CO {abn}</NonIndividualNameText></NonIndividualName></MainEntity></ABR>"#
        )
    }

    fn write_doc(dir: &Path, name: &str, first: u64, count: u64) -> PathBuf {
        let records: Vec<String> = (first..first + count)
            .map(|n| record_xml(&format!("{}", 10_000_000_000u64 + n)))
            .collect();
        write_raw(dir, name, &format!("<Transfer>{}</Transfer>", records.join("")))
    }

    fn write_raw(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn config(sampling: SamplingConfig, batch_size: usize) -> IngestConfig {
        IngestConfig::default()
            .with_sampling(sampling)
            .with_batch_size(batch_size)
    }

    /// Rejects any abn_records upsert containing the given ABN
    struct RejectingStore {
        inner: MemoryStore,
        reject_abn: String,
    }

    impl TableStore for RejectingStore {
        fn upsert(&mut self, table: Table, rows: &[Row], key: &str) -> Result<usize, StoreError> {
            if table == Table::AbnRecords
                && rows.iter().any(|r| r["abn"].as_str() == Some(self.reject_abn.as_str()))
            {
                return Err(StoreError::Backend("rejected".to_string()));
            }
            self.inner.upsert(table, rows, key)
        }

        fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError> {
            self.inner.insert(table, rows)
        }

        fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError> {
            self.inner.delete_in(table, column, values)
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Pipeline::new(IngestConfig::default().with_batch_size(0), MemoryStore::new());
        assert!(matches!(result, Err(IngestError::InvalidConfig(_))));
    }

    #[test]
    fn test_runs_all_files_unlimited() {
        let dir = TempDir::new().unwrap();
        let a = write_doc(dir.path(), "a.xml", 0, 3);
        let b = write_doc(dir.path(), "b.xml", 3, 4);

        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 2), MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[a, b], &mut NoProgress).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.records_accepted, 7);
        assert_eq!(summary.records_persisted, 7);
        // two batches per file
        assert_eq!(summary.batches_persisted, 4);
        assert!(summary.finished_at.is_some());
        assert_eq!(pipeline.store().count(Table::AbnRecords), 7);
        assert_eq!(pipeline.store().count(Table::MainEntity), 7);
    }

    #[test]
    fn test_batches_persist_while_document_is_read() {
        let dir = TempDir::new().unwrap();
        let a = write_doc(dir.path(), "a.xml", 0, 5);

        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let config = config(SamplingConfig::unlimited(), 2).with_progress_interval(1);
        let mut pipeline = Pipeline::new(config, MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[a], &mut sink).unwrap();
        assert_eq!(summary.batches_persisted, 3);

        let position = |wanted: &dyn Fn(&ProgressEvent) -> bool| events.iter().position(|e| wanted(e)).unwrap();
        let first_batch = position(&|e: &ProgressEvent| matches!(e, ProgressEvent::BatchPersisted { offset: 0, .. }));
        let third_record = position(&|e: &ProgressEvent| matches!(e, ProgressEvent::RecordsAccepted { in_document: 3, .. }));
        let finished = position(&|e: &ProgressEvent| matches!(e, ProgressEvent::DocumentFinished { .. }));
        assert!(first_batch < third_record);
        assert!(third_record < finished);
        // the trailing partial batch is flushed once the stream ends
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::BatchPersisted { offset: 4, records: 1, persisted_total: 5 })
        ));
    }

    #[test]
    fn test_sample_limit_spans_files() {
        let dir = TempDir::new().unwrap();
        let a = write_doc(dir.path(), "a.xml", 0, 3);
        let b = write_doc(dir.path(), "b.xml", 3, 3);
        let c = write_doc(dir.path(), "c.xml", 6, 3);

        let mut pipeline = Pipeline::new(config(SamplingConfig::limited(5), 10), MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[a, b, c], &mut NoProgress).unwrap();

        assert!(summary.sample_reached);
        assert_eq!(summary.records_accepted, 5);
        assert_eq!(summary.files_processed, 2);
        assert_eq!(pipeline.store().count(Table::AbnRecords), 5);
    }

    #[test]
    fn test_document_failure_keeps_earlier_records() {
        let dir = TempDir::new().unwrap();
        let broken = write_raw(
            dir.path(),
            "a.xml",
            &format!("<Transfer>{}<ABR><ABN>oops</Transfer>", record_xml("10000000001")),
        );
        let good = write_doc(dir.path(), "b.xml", 5, 2);

        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 10), MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[broken, good], &mut NoProgress).unwrap();

        assert_eq!(summary.document_failures.len(), 1);
        assert_eq!(summary.document_failures[0].source_name, "a.xml");
        assert_eq!(summary.document_failures[0].accepted_before_failure, 1);
        assert!(!summary.is_success());
        assert_eq!(summary.records_persisted, 3);
        assert_eq!(pipeline.store().rows_for(Table::AbnRecords, "10000000001").len(), 1);
    }

    #[test]
    fn test_missing_file_is_a_document_failure() {
        let dir = TempDir::new().unwrap();
        let good = write_doc(dir.path(), "b.xml", 0, 1);
        let missing = dir.path().join("missing.xml");

        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 10), MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[missing, good], &mut NoProgress).unwrap();

        assert_eq!(summary.document_failures.len(), 1);
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.records_persisted, 1);
    }

    #[test]
    fn test_file_without_records() {
        let dir = TempDir::new().unwrap();
        let empty = write_raw(dir.path(), "empty.xml", "<Transfer><ABR><ABN>bad</ABN></ABR></Transfer>");

        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 10), MemoryStore::new()).unwrap();
        let summary = pipeline.run(&[empty], &mut NoProgress).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.files_without_records, 1);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(summary.batches_persisted, 0);
    }

    #[test]
    fn test_failed_batch_halts_run() {
        let dir = TempDir::new().unwrap();
        let a = write_doc(dir.path(), "a.xml", 0, 6);
        let b = write_doc(dir.path(), "b.xml", 6, 2);
        let store = RejectingStore {
            inner: MemoryStore::new(),
            reject_abn: "10000000003".to_string(),
        };

        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 2), store).unwrap();
        let summary = pipeline.run(&[a, b], &mut sink).unwrap();

        assert!(summary.halted);
        assert_eq!(summary.batch_failures.len(), 1);
        assert_eq!(summary.batch_failures[0].offset, 2);
        assert_eq!(summary.batch_failures[0].step, Some(PersistStep::UpsertRecords));
        assert_eq!(summary.records_persisted, 2);
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::BatchFailed { offset: 2, .. })));
        // b.xml never reached the store
        assert!(pipeline.store().inner.rows_for(Table::AbnRecords, "10000000006").is_empty());
    }

    #[test]
    fn test_continue_past_failed_batch() {
        let dir = TempDir::new().unwrap();
        let a = write_doc(dir.path(), "a.xml", 0, 6);
        let b = write_doc(dir.path(), "b.xml", 6, 2);
        let store = RejectingStore {
            inner: MemoryStore::new(),
            reject_abn: "10000000003".to_string(),
        };

        let config = config(SamplingConfig::unlimited(), 2).with_halt_on_batch_failure(false);
        let mut pipeline = Pipeline::new(config, store).unwrap();
        let summary = pipeline.run(&[a, b], &mut NoProgress).unwrap();

        assert!(!summary.halted);
        assert_eq!(summary.batch_failures.len(), 1);
        assert_eq!(summary.batch_failures[0].offset, 2);
        assert_eq!(summary.records_persisted, 6);
        assert_eq!(pipeline.into_store().inner.count(Table::AbnRecords), 6);
    }

    #[test]
    fn test_discover_xml_files_recursive_and_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_raw(dir.path(), "b.xml", "<Transfer/>");
        write_raw(dir.path(), "a.XML", "<Transfer/>");
        write_raw(dir.path(), "notes.txt", "ignore");
        write_raw(&dir.path().join("nested"), "c.xml", "<Transfer/>");

        let files = discover_xml_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.XML", "b.xml", "nested/c.xml"]);
    }

    #[test]
    fn test_run_directory() {
        let dir = TempDir::new().unwrap();
        write_doc(dir.path(), "20240101_Public01.xml", 0, 2);
        write_doc(dir.path(), "20240101_Public02.xml", 2, 2);

        let mut pipeline = Pipeline::new(config(SamplingConfig::unlimited(), 10), MemoryStore::new()).unwrap();
        let summary = pipeline.run_directory(dir.path(), &mut NoProgress).unwrap();
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.records_persisted, 4);
    }
}
