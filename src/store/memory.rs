// In-memory table store
// Same contract as the SQLite backend without the relational constraints.
// Every call validates before it mutates, so a failed call changes nothing.

use std::collections::HashMap;

use super::{row_columns, Row, Table, TableStore};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: HashMap<Table, Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently stored in `table`, in insertion order
    pub fn rows(&self, table: Table) -> &[Row] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, table: Table) -> usize {
        self.rows(table).len()
    }

    /// Rows of `table` whose `abn` column equals `abn`
    pub fn rows_for(&self, table: Table, abn: &str) -> Vec<&Row> {
        self.rows(table)
            .iter()
            .filter(|row| row.get("abn").and_then(|v| v.as_str()) == Some(abn))
            .collect()
    }
}

impl TableStore for MemoryStore {
    fn upsert(&mut self, table: Table, rows: &[Row], conflict_key: &str) -> Result<usize, StoreError> {
        table.check_conflict_key(conflict_key)?;
        row_columns(table, rows)?;
        if rows.iter().any(|row| !row.contains_key(conflict_key)) {
            return Err(StoreError::Backend(format!(
                "row without '{}' for upsert into {}",
                conflict_key, table
            )));
        }

        let stored = self.tables.entry(table).or_default();
        for row in rows {
            let key = row.get(conflict_key);
            match stored.iter_mut().find(|existing| existing.get(conflict_key) == key) {
                Some(existing) => *existing = row.clone(),
                None => stored.push(row.clone()),
            }
        }
        Ok(rows.len())
    }

    fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError> {
        row_columns(table, rows)?;
        self.tables
            .entry(table)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len())
    }

    fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError> {
        table.check_column(column)?;
        let Some(stored) = self.tables.get_mut(&table) else {
            return Ok(0);
        };

        let before = stored.len();
        stored.retain(|row| {
            let value = row.get(column).and_then(|v| v.as_str());
            !value.is_some_and(|v| values.iter().any(|target| target == v))
        });
        Ok(before - stored.len())
    }
}
