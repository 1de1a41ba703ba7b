// Persistence backend contract
// Three table operations, each atomic per call and always invoked with a whole
// batch of rows: upsert, insert and delete_in. SqliteStore is the durable
// backend; MemoryStore keeps rows in process for tests and dry runs.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{setup_database, SqliteStore};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// One row: column name -> value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Logical tables of the normalized register schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    AbnRecords,
    MainEntity,
    LegalEntity,
    AsicNumbers,
    GstRegistrations,
    BusinessAddresses,
    DgrEntries,
    OtherEntityNames,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::AbnRecords,
        Table::MainEntity,
        Table::LegalEntity,
        Table::AsicNumbers,
        Table::GstRegistrations,
        Table::BusinessAddresses,
        Table::DgrEntries,
        Table::OtherEntityNames,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::AbnRecords => "abn_records",
            Table::MainEntity => "main_entity",
            Table::LegalEntity => "legal_entity",
            Table::AsicNumbers => "asic_numbers",
            Table::GstRegistrations => "gst_registrations",
            Table::BusinessAddresses => "business_addresses",
            Table::DgrEntries => "dgr_entries",
            Table::OtherEntityNames => "other_entity_names",
        }
    }

    /// Columns a caller may write
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::AbnRecords => &[
                "abn",
                "record_last_updated_date",
                "abn_status",
                "abn_status_from_date",
                "entity_type_ind",
                "entity_type_text",
            ],
            Table::MainEntity => &["abn", "type", "text"],
            Table::LegalEntity => &[
                "abn",
                "type",
                "title",
                "given_name_1",
                "given_name_2",
                "family_name",
            ],
            Table::AsicNumbers => &["abn", "asic_number"],
            Table::GstRegistrations => &["abn", "status", "status_from_date"],
            Table::BusinessAddresses => &["abn", "state_code", "postcode"],
            Table::DgrEntries => &["abn", "status_from_date", "status", "type", "text"],
            Table::OtherEntityNames => &["abn", "type", "text"],
        }
    }

    /// Unique key usable for upsert; child collections have none
    pub fn conflict_key(&self) -> Option<&'static str> {
        match self {
            Table::DgrEntries | Table::OtherEntityNames => None,
            _ => Some("abn"),
        }
    }

    /// Validate a column name against the declared schema
    pub fn check_column(&self, column: &str) -> Result<(), StoreError> {
        if self.columns().contains(&column) {
            Ok(())
        } else {
            Err(StoreError::UnknownColumn {
                table: self.name().to_string(),
                column: column.to_string(),
            })
        }
    }

    pub fn check_conflict_key(&self, column: &str) -> Result<(), StoreError> {
        if self.conflict_key() == Some(column) {
            Ok(())
        } else {
            Err(StoreError::InvalidConflictKey {
                table: self.name().to_string(),
                column: column.to_string(),
            })
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Table API the batch persister writes through
///
/// Every call must be all-or-nothing: on `Err` no row of that call is stored.
pub trait TableStore {
    /// Insert rows, replacing any row whose `conflict_key` value already exists
    fn upsert(&mut self, table: Table, rows: &[Row], conflict_key: &str) -> Result<usize, StoreError>;

    /// Append rows
    fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError>;

    /// Delete every row whose `column` value is in `values`
    fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError>;
}

impl<S: TableStore + ?Sized> TableStore for &mut S {
    fn upsert(&mut self, table: Table, rows: &[Row], conflict_key: &str) -> Result<usize, StoreError> {
        (**self).upsert(table, rows, conflict_key)
    }

    fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError> {
        (**self).insert(table, rows)
    }

    fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError> {
        (**self).delete_in(table, column, values)
    }
}

/// Ordered union of the columns used by `rows`, validated against `table`
pub(crate) fn row_columns(table: Table, rows: &[Row]) -> Result<Vec<String>, StoreError> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                table.check_column(key)?;
                columns.push(key.clone());
            }
        }
    }
    Ok(columns)
}
