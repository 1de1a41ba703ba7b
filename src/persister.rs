// Batch Persister
// Fans a batch of NormalizedRecords into per-table row sets and writes them in a
// fixed order: parents first, then keyed children, then delete-and-insert of
// the unkeyed child collections. The first failing step fails the whole batch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

use crate::config::IngestConfig;
use crate::error::{IngestError, StoreError};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::record::NormalizedRecord;
use crate::store::{Row, Table, TableStore};

// ============================================================================
// STEPS
// ============================================================================

/// One remote call within a batch, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistStep {
    PrepareRows,
    UpsertRecords,
    UpsertMainEntity,
    UpsertLegalEntity,
    UpsertAsicNumbers,
    UpsertGstRegistrations,
    UpsertBusinessAddresses,
    DeleteDgrEntries,
    DeleteOtherEntityNames,
    InsertDgrEntries,
    InsertOtherEntityNames,
}

impl PersistStep {
    pub fn table(&self) -> Option<Table> {
        match self {
            PersistStep::PrepareRows => None,
            PersistStep::UpsertRecords => Some(Table::AbnRecords),
            PersistStep::UpsertMainEntity => Some(Table::MainEntity),
            PersistStep::UpsertLegalEntity => Some(Table::LegalEntity),
            PersistStep::UpsertAsicNumbers => Some(Table::AsicNumbers),
            PersistStep::UpsertGstRegistrations => Some(Table::GstRegistrations),
            PersistStep::UpsertBusinessAddresses => Some(Table::BusinessAddresses),
            PersistStep::DeleteDgrEntries | PersistStep::InsertDgrEntries => Some(Table::DgrEntries),
            PersistStep::DeleteOtherEntityNames | PersistStep::InsertOtherEntityNames => {
                Some(Table::OtherEntityNames)
            }
        }
    }
}

impl fmt::Display for PersistStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistStep::PrepareRows => f.write_str("row preparation"),
            PersistStep::UpsertRecords
            | PersistStep::UpsertMainEntity
            | PersistStep::UpsertLegalEntity
            | PersistStep::UpsertAsicNumbers
            | PersistStep::UpsertGstRegistrations
            | PersistStep::UpsertBusinessAddresses => write!(f, "upsert into {}", self.table_name()),
            PersistStep::DeleteDgrEntries | PersistStep::DeleteOtherEntityNames => {
                write!(f, "delete from {}", self.table_name())
            }
            PersistStep::InsertDgrEntries | PersistStep::InsertOtherEntityNames => {
                write!(f, "insert into {}", self.table_name())
            }
        }
    }
}

impl PersistStep {
    fn table_name(&self) -> &'static str {
        self.table().map(|t| t.name()).unwrap_or("-")
    }
}

// ============================================================================
// ROW SHAPES
// ============================================================================

#[derive(Serialize)]
struct AbnRecordRow<'a> {
    abn: &'a str,
    record_last_updated_date: Option<&'a str>,
    abn_status: Option<&'a str>,
    abn_status_from_date: Option<&'a str>,
    entity_type_ind: Option<&'a str>,
    entity_type_text: Option<&'a str>,
}

#[derive(Serialize)]
struct NameRow<'a> {
    abn: &'a str,
    #[serde(rename = "type")]
    name_type: Option<&'a str>,
    text: Option<&'a str>,
}

#[derive(Serialize)]
struct LegalEntityRow<'a> {
    abn: &'a str,
    #[serde(rename = "type")]
    name_type: Option<&'a str>,
    title: Option<&'a str>,
    given_name_1: Option<&'a str>,
    given_name_2: Option<&'a str>,
    family_name: Option<&'a str>,
}

#[derive(Serialize)]
struct AsicNumberRow<'a> {
    abn: &'a str,
    asic_number: &'a str,
}

#[derive(Serialize)]
struct GstRegistrationRow<'a> {
    abn: &'a str,
    status: Option<&'a str>,
    status_from_date: Option<&'a str>,
}

#[derive(Serialize)]
struct BusinessAddressRow<'a> {
    abn: &'a str,
    state_code: Option<&'a str>,
    postcode: Option<&'a str>,
}

#[derive(Serialize)]
struct DgrEntryRow<'a> {
    abn: &'a str,
    status_from_date: Option<&'a str>,
    status: Option<&'a str>,
    #[serde(rename = "type")]
    name_type: Option<&'a str>,
    text: Option<&'a str>,
}

fn to_row<T: Serialize>(value: &T) -> Result<Row, serde_json::Error> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(<serde_json::Error as serde::ser::Error>::custom(
            "row must serialize to an object",
        )),
    }
}

/// Per-table rows for one batch
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchRows {
    pub abns: Vec<String>,
    pub abn_records: Vec<Row>,
    pub main_entity: Vec<Row>,
    pub legal_entity: Vec<Row>,
    pub asic_numbers: Vec<Row>,
    pub gst_registrations: Vec<Row>,
    pub business_addresses: Vec<Row>,
    pub dgr_entries: Vec<Row>,
    pub other_entity_names: Vec<Row>,
}

impl BatchRows {
    /// Fan records out into table rows; absent sub-entities produce no row
    ///
    /// An ABN repeated within the batch keeps only its last occurrence.
    pub fn from_records(records: &[NormalizedRecord]) -> Result<Self, serde_json::Error> {
        let mut rows = BatchRows::default();

        let last_seen: HashMap<&str, usize> = records
            .iter()
            .enumerate()
            .map(|(i, record)| (record.abn(), i))
            .collect();

        for (i, record) in records.iter().enumerate() {
            if last_seen.get(record.abn()) != Some(&i) {
                continue;
            }
            let id = &record.identity;
            let abn = id.abn.as_str();
            rows.abns.push(id.abn.clone());

            rows.abn_records.push(to_row(&AbnRecordRow {
                abn,
                record_last_updated_date: id.record_last_updated.as_deref(),
                abn_status: id.status.as_deref(),
                abn_status_from_date: id.status_from_date.as_deref(),
                entity_type_ind: id.entity_type_code.as_deref(),
                entity_type_text: id.entity_type_text.as_deref(),
            })?);

            if let Some(ref org) = record.organization_name {
                rows.main_entity.push(to_row(&NameRow {
                    abn,
                    name_type: org.name_type.as_deref(),
                    text: org.text.as_deref(),
                })?);
            }
            if let Some(ref person) = record.individual_name {
                rows.legal_entity.push(to_row(&LegalEntityRow {
                    abn,
                    name_type: person.name_type.as_deref(),
                    title: person.title.as_deref(),
                    given_name_1: person.given_name_1.as_deref(),
                    given_name_2: person.given_name_2.as_deref(),
                    family_name: person.family_name.as_deref(),
                })?);
            }
            if let Some(asic_number) = record.external_registration_number.as_deref() {
                rows.asic_numbers.push(to_row(&AsicNumberRow { abn, asic_number })?);
            }
            if let Some(ref gst) = record.tax_registration {
                rows.gst_registrations.push(to_row(&GstRegistrationRow {
                    abn,
                    status: gst.status.as_deref(),
                    status_from_date: gst.status_from_date.as_deref(),
                })?);
            }
            if let Some(ref address) = record.address {
                rows.business_addresses.push(to_row(&BusinessAddressRow {
                    abn,
                    state_code: address.state_code.as_deref(),
                    postcode: address.postcode.as_deref(),
                })?);
            }
            for entry in record.concession_entries.iter().flatten() {
                rows.dgr_entries.push(to_row(&DgrEntryRow {
                    abn,
                    status_from_date: entry.status_from_date.as_deref(),
                    status: entry.status.as_deref(),
                    name_type: entry.name_type.as_deref(),
                    text: entry.text.as_deref(),
                })?);
            }
            for name in record.alternate_names.iter().flatten() {
                rows.other_entity_names.push(to_row(&NameRow {
                    abn,
                    name_type: name.name_type.as_deref(),
                    text: name.text.as_deref(),
                })?);
            }
        }

        Ok(rows)
    }
}

// ============================================================================
// PERSISTER
// ============================================================================

/// Result of one successfully persisted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Offset of the batch's first record in the run
    pub offset: usize,
    pub records: usize,
    /// Rows written across all tables (deletes not included)
    pub rows_written: usize,
    /// Steps actually executed, in order
    pub steps: Vec<PersistStep>,
}

/// Totals for a sequence of batches
#[derive(Debug, Default)]
pub struct PersistSummary {
    pub batches_persisted: usize,
    pub records_persisted: usize,
    /// Only populated when the persister continues past failures
    pub failures: Vec<IngestError>,
}

pub struct BatchPersister<S: TableStore> {
    store: S,
    batch_size: usize,
    halt_on_failure: bool,
    /// Lifetime totals across every `persist_all` call
    batches_persisted: usize,
    records_persisted: usize,
}

impl<S: TableStore> BatchPersister<S> {
    pub fn new(store: S, config: &IngestConfig) -> Self {
        BatchPersister {
            store,
            batch_size: config.batch_size.max(1),
            halt_on_failure: config.halt_on_batch_failure,
            batches_persisted: 0,
            records_persisted: 0,
        }
    }

    pub fn batches_persisted(&self) -> usize {
        self.batches_persisted
    }

    pub fn records_persisted(&self) -> usize {
        self.records_persisted
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Persist one batch; the first failing step aborts the rest
    ///
    /// Earlier steps of a failed batch are not undone.
    pub fn persist_batch(&mut self, offset: usize, records: &[NormalizedRecord]) -> Result<BatchReport, IngestError> {
        let fail = move |step: PersistStep| move |source: StoreError| IngestError::BatchPersist { offset, step, source };

        let rows = BatchRows::from_records(records)
            .map_err(|e| fail(PersistStep::PrepareRows)(StoreError::from(e)))?;

        let mut report = BatchReport {
            offset,
            records: records.len(),
            rows_written: 0,
            steps: Vec::new(),
        };

        let upserts = [
            (PersistStep::UpsertRecords, &rows.abn_records),
            (PersistStep::UpsertMainEntity, &rows.main_entity),
            (PersistStep::UpsertLegalEntity, &rows.legal_entity),
            (PersistStep::UpsertAsicNumbers, &rows.asic_numbers),
            (PersistStep::UpsertGstRegistrations, &rows.gst_registrations),
            (PersistStep::UpsertBusinessAddresses, &rows.business_addresses),
        ];
        for (step, table_rows) in upserts {
            if table_rows.is_empty() {
                continue;
            }
            let table = table_for(step);
            let key = table.conflict_key().unwrap_or("abn");
            report.rows_written += self
                .store
                .upsert(table, table_rows, key)
                .map_err(fail(step))?;
            report.steps.push(step);
        }

        // Child collections are replaced wholesale, so deletes always run
        for step in [PersistStep::DeleteDgrEntries, PersistStep::DeleteOtherEntityNames] {
            self.store
                .delete_in(table_for(step), "abn", &rows.abns)
                .map_err(fail(step))?;
            report.steps.push(step);
        }

        let inserts = [
            (PersistStep::InsertDgrEntries, &rows.dgr_entries),
            (PersistStep::InsertOtherEntityNames, &rows.other_entity_names),
        ];
        for (step, table_rows) in inserts {
            if table_rows.is_empty() {
                continue;
            }
            report.rows_written += self
                .store
                .insert(table_for(step), table_rows)
                .map_err(fail(step))?;
            report.steps.push(step);
        }

        debug!(offset, records = report.records, rows = report.rows_written, "Batch persisted");
        Ok(report)
    }

    /// Persist `records` in batches of `batch_size`, starting at run offset `start_offset`
    ///
    /// Halts at the first failed batch unless configured to continue, in which
    /// case failures are collected in the summary.
    pub fn persist_all<I>(
        &mut self,
        records: I,
        start_offset: usize,
        sink: &mut dyn ProgressSink,
    ) -> Result<PersistSummary, IngestError>
    where
        I: IntoIterator<Item = NormalizedRecord>,
    {
        let mut summary = PersistSummary::default();
        let mut offset = start_offset;
        let mut batch = Vec::with_capacity(self.batch_size);

        for record in records {
            batch.push(record);
            if batch.len() == self.batch_size {
                self.flush(&mut batch, &mut offset, &mut summary, sink)?;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &mut offset, &mut summary, sink)?;
        }

        Ok(summary)
    }

    fn flush(
        &mut self,
        batch: &mut Vec<NormalizedRecord>,
        offset: &mut usize,
        summary: &mut PersistSummary,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), IngestError> {
        let len = batch.len();
        let result = self.persist_batch(*offset, batch);
        batch.clear();
        let batch_offset = *offset;
        *offset += len;

        match result {
            Ok(_) => {
                summary.batches_persisted += 1;
                summary.records_persisted += len;
                self.batches_persisted += 1;
                self.records_persisted += len;
                sink.on_event(&ProgressEvent::BatchPersisted {
                    offset: batch_offset,
                    records: len,
                    persisted_total: self.records_persisted,
                });
                Ok(())
            }
            Err(e) => {
                error!(offset = batch_offset, records = len, error = %e, "Batch failed");
                sink.on_event(&ProgressEvent::BatchFailed {
                    offset: batch_offset,
                    records: len,
                    error: e.to_string(),
                });
                if self.halt_on_failure {
                    Err(e)
                } else {
                    summary.failures.push(e);
                    Ok(())
                }
            }
        }
    }
}

fn table_for(step: PersistStep) -> Table {
    step.table().unwrap_or(Table::AbnRecords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::record::{
        AbnIdentity, AlternateName, BusinessAddress, ConcessionEntry, IndividualName,
        OrganizationName, TaxRegistration,
    };
    use crate::store::MemoryStore;
    use serde_json::json;

    /// Wraps a store and fails one chosen call
    struct FailingStore {
        inner: MemoryStore,
        fail_on: PersistStep,
        /// Record offset whose batch should fail; `None` fails every batch
        fail_offset: Option<usize>,
        current_offset: usize,
        batch_calls: Vec<(Table, &'static str)>,
    }

    impl FailingStore {
        fn new(fail_on: PersistStep, fail_offset: Option<usize>) -> Self {
            FailingStore {
                inner: MemoryStore::new(),
                fail_on,
                fail_offset,
                current_offset: 0,
                batch_calls: Vec::new(),
            }
        }

        fn check(&mut self, table: Table, op: &'static str) -> Result<(), StoreError> {
            self.batch_calls.push((table, op));
            let step_matches = self.fail_on.table() == Some(table)
                && self.fail_on.to_string().starts_with(op);
            let offset_matches = self.fail_offset.map_or(true, |o| o == self.current_offset);
            if step_matches && offset_matches {
                return Err(StoreError::Backend("injected failure".to_string()));
            }
            Ok(())
        }
    }

    impl TableStore for FailingStore {
        fn upsert(&mut self, table: Table, rows: &[Row], key: &str) -> Result<usize, StoreError> {
            if table == Table::AbnRecords {
                self.current_offset = rows
                    .first()
                    .and_then(|r| r["abn"].as_str())
                    .and_then(|abn| abn.parse::<usize>().ok())
                    .map(|n| n - 10_000_000_000)
                    .unwrap_or(0);
            }
            self.check(table, "upsert")?;
            self.inner.upsert(table, rows, key)
        }

        fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError> {
            self.check(table, "insert")?;
            self.inner.insert(table, rows)
        }

        fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError> {
            self.check(table, "delete")?;
            self.inner.delete_in(table, column, values)
        }
    }

    fn identity(abn: &str) -> AbnIdentity {
        AbnIdentity {
            abn: abn.to_string(),
            status: Some("ACT".to_string()),
            status_from_date: Some("20000101".to_string()),
            record_last_updated: Some("20240101".to_string()),
            entity_type_code: Some("IND".to_string()),
            entity_type_text: Some("Individual/Sole Trader".to_string()),
        }
    }

    fn full_record(abn: &str) -> NormalizedRecord {
        let mut record = NormalizedRecord::new(identity(abn));
        record.individual_name = Some(IndividualName {
            name_type: Some("LGL".to_string()),
            title: None,
            given_name_1: Some("JANE".to_string()),
            given_name_2: None,
            family_name: Some("CITIZEN".to_string()),
        });
        record.organization_name = Some(OrganizationName {
            name_type: Some("MN".to_string()),
            text: Some("JANE'S BAKERY".to_string()),
        });
        record.external_registration_number = Some("123456789".to_string());
        record.tax_registration = Some(TaxRegistration {
            status: Some("ACT".to_string()),
            status_from_date: Some("20010101".to_string()),
        });
        record.address = Some(BusinessAddress {
            state_code: Some("TAS".to_string()),
            postcode: Some("7000".to_string()),
        });
        record.concession_entries = Some(vec![ConcessionEntry {
            status_from_date: Some("20150101".to_string()),
            status: None,
            name_type: None,
            text: None,
        }]);
        record.alternate_names = Some(vec![
            AlternateName {
                name_type: Some("TRD".to_string()),
                text: Some("BAKED GOODS".to_string()),
            },
            AlternateName {
                name_type: Some("BN".to_string()),
                text: Some("JANE'S BREAD".to_string()),
            },
        ]);
        record
    }

    fn numbered(count: usize) -> Vec<NormalizedRecord> {
        (0..count)
            .map(|i| NormalizedRecord::new(identity(&format!("{}", 10_000_000_000u64 + i as u64))))
            .collect()
    }

    fn config(batch_size: usize) -> IngestConfig {
        IngestConfig::default().with_batch_size(batch_size)
    }

    #[test]
    fn test_fan_out_skips_absent_sub_entities() {
        let rows = BatchRows::from_records(&numbered(2)).unwrap();
        assert_eq!(rows.abns.len(), 2);
        assert_eq!(rows.abn_records.len(), 2);
        assert!(rows.main_entity.is_empty());
        assert!(rows.legal_entity.is_empty());
        assert!(rows.asic_numbers.is_empty());
        assert!(rows.gst_registrations.is_empty());
        assert!(rows.business_addresses.is_empty());
        assert!(rows.dgr_entries.is_empty());
        assert!(rows.other_entity_names.is_empty());
    }

    #[test]
    fn test_fan_out_full_record() {
        let rows = BatchRows::from_records(&[full_record("53004085616")]).unwrap();
        assert_eq!(rows.abn_records[0]["abn_status"], json!("ACT"));
        assert_eq!(rows.main_entity[0]["type"], json!("MN"));
        assert_eq!(rows.legal_entity[0]["given_name_2"], json!(null));
        assert_eq!(rows.asic_numbers[0]["asic_number"], json!("123456789"));
        assert_eq!(rows.dgr_entries.len(), 1);
        assert_eq!(rows.other_entity_names.len(), 2);
        assert!(rows.other_entity_names.iter().all(|r| r["abn"] == json!("53004085616")));
    }

    #[test]
    fn test_fan_out_keeps_last_duplicate() {
        let mut first = full_record("53004085616");
        first.external_registration_number = Some("111111111".to_string());
        let second = full_record("53004085616");
        let rows = BatchRows::from_records(&[first, full_record("11111111111"), second]).unwrap();

        assert_eq!(rows.abns, vec!["11111111111", "53004085616"]);
        assert_eq!(rows.abn_records.len(), 2);
        assert_eq!(rows.asic_numbers[1]["asic_number"], json!("123456789"));
        assert_eq!(rows.other_entity_names.len(), 4);
    }

    #[test]
    fn test_duplicate_abn_end_state_independent_of_batch_size() {
        let with_names = |names: &[&str]| {
            let mut record = NormalizedRecord::new(identity("53004085616"));
            record.alternate_names = Some(
                names
                    .iter()
                    .map(|text| AlternateName {
                        name_type: Some("TRD".to_string()),
                        text: Some(text.to_string()),
                    })
                    .collect(),
            );
            record
        };
        let records = vec![with_names(&["A"]), with_names(&["B"])];

        let mut stores = Vec::new();
        for batch_size in [1, 2] {
            let mut persister = BatchPersister::new(MemoryStore::new(), &config(batch_size));
            persister.persist_all(records.clone(), 0, &mut NoProgress).unwrap();
            stores.push(persister.into_store());
        }

        for table in Table::ALL {
            assert_eq!(stores[0].rows(table), stores[1].rows(table), "table {} differs", table);
        }
        let names: Vec<_> = stores[1]
            .rows(Table::OtherEntityNames)
            .iter()
            .map(|row| row["text"].clone())
            .collect();
        assert_eq!(names, vec![json!("B")]);
    }

    #[test]
    fn test_persist_batch_step_order() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(10));
        let report = persister.persist_batch(0, &[full_record("53004085616")]).unwrap();

        assert_eq!(
            report.steps,
            vec![
                PersistStep::UpsertRecords,
                PersistStep::UpsertMainEntity,
                PersistStep::UpsertLegalEntity,
                PersistStep::UpsertAsicNumbers,
                PersistStep::UpsertGstRegistrations,
                PersistStep::UpsertBusinessAddresses,
                PersistStep::DeleteDgrEntries,
                PersistStep::DeleteOtherEntityNames,
                PersistStep::InsertDgrEntries,
                PersistStep::InsertOtherEntityNames,
            ]
        );
        assert_eq!(report.rows_written, 9);
    }

    #[test]
    fn test_bare_batch_runs_only_required_steps() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(10));
        let report = persister.persist_batch(0, &numbered(3)).unwrap();
        assert_eq!(
            report.steps,
            vec![
                PersistStep::UpsertRecords,
                PersistStep::DeleteDgrEntries,
                PersistStep::DeleteOtherEntityNames,
            ]
        );
    }

    #[test]
    fn test_persisting_twice_is_idempotent() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(10));
        let batch = vec![full_record("53004085616"), full_record("11111111111")];

        persister.persist_batch(0, &batch).unwrap();
        let once = persister.store().clone();
        persister.persist_batch(0, &batch).unwrap();
        let twice = persister.store();

        for table in Table::ALL {
            assert_eq!(once.rows(table), twice.rows(table), "table {} differs", table);
        }
        assert_eq!(twice.count(Table::OtherEntityNames), 4);
    }

    #[test]
    fn test_children_are_replaced_not_appended() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(10));
        persister.persist_batch(0, &[full_record("53004085616")]).unwrap();

        let mut updated = full_record("53004085616");
        updated.alternate_names = None;
        updated.concession_entries = None;
        persister.persist_batch(0, &[updated]).unwrap();

        assert_eq!(persister.store().count(Table::OtherEntityNames), 0);
        assert_eq!(persister.store().count(Table::DgrEntries), 0);
    }

    #[test]
    fn test_failed_step_stops_batch() {
        let store = FailingStore::new(PersistStep::DeleteDgrEntries, None);
        let mut persister = BatchPersister::new(store, &config(10));

        let err = persister.persist_batch(40, &[full_record("53004085616")]).unwrap_err();
        match err {
            IngestError::BatchPersist { offset, step, .. } => {
                assert_eq!(offset, 40);
                assert_eq!(step, PersistStep::DeleteDgrEntries);
            }
            other => panic!("unexpected error: {other}"),
        }

        let store = persister.into_store();
        // Upserts before the failure remain; nothing after it ran
        assert_eq!(store.inner.count(Table::AbnRecords), 1);
        assert_eq!(store.inner.count(Table::OtherEntityNames), 0);
        assert_eq!(store.batch_calls.last(), Some(&(Table::DgrEntries, "delete")));
    }

    #[test]
    fn test_persist_all_halts_on_failed_batch() {
        let store = FailingStore::new(PersistStep::DeleteDgrEntries, Some(2));
        let mut persister = BatchPersister::new(store, &config(2));

        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let err = persister.persist_all(numbered(6), 0, &mut sink).unwrap_err();

        assert_eq!(err.batch_offset(), Some(2));
        assert_eq!(persister.records_persisted(), 2);
        let store = persister.into_store();
        assert_eq!(store.inner.count(Table::AbnRecords), 4);
        assert!(store.inner.rows_for(Table::AbnRecords, "10000000004").is_empty());
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::BatchFailed { offset: 2, .. })));
    }

    #[test]
    fn test_persist_all_can_continue_past_failure() {
        let store = FailingStore::new(PersistStep::DeleteDgrEntries, Some(2));
        let mut persister = BatchPersister::new(store, &config(2).with_halt_on_batch_failure(false));

        let summary = persister.persist_all(numbered(6), 0, &mut NoProgress).unwrap();

        assert_eq!(summary.batches_persisted, 2);
        assert_eq!(summary.records_persisted, 4);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].batch_offset(), Some(2));

        let store = persister.into_store();
        assert_eq!(store.inner.rows_for(Table::AbnRecords, "10000000000").len(), 1);
        assert_eq!(store.inner.rows_for(Table::AbnRecords, "10000000005").len(), 1);
    }

    #[test]
    fn test_persist_all_batches_and_offsets() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(4));
        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());

        let summary = persister.persist_all(numbered(10), 100, &mut sink).unwrap();

        assert_eq!(summary.batches_persisted, 3);
        assert_eq!(summary.records_persisted, 10);
        let offsets: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::BatchPersisted { offset, records, .. } => Some((*offset, *records)),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![(100, 4), (104, 4), (108, 2)]);
    }

    #[test]
    fn test_persist_all_empty_input() {
        let mut persister = BatchPersister::new(MemoryStore::new(), &config(4));
        let summary = persister.persist_all(Vec::new(), 0, &mut NoProgress).unwrap();
        assert_eq!(summary.batches_persisted, 0);
        assert_eq!(persister.store().count(Table::AbnRecords), 0);
    }

    #[test]
    fn test_step_display() {
        assert_eq!(PersistStep::UpsertRecords.to_string(), "upsert into abn_records");
        assert_eq!(PersistStep::DeleteDgrEntries.to_string(), "delete from dgr_entries");
        assert_eq!(PersistStep::InsertOtherEntityNames.to_string(), "insert into other_entity_names");
    }
}
