// SQLite table store
// WAL journal, foreign keys on, one transaction per call.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{row_columns, Row, Table, TableStore};
use crate::error::StoreError;

/// SQLite limits bound parameters per statement; stay well under it
const DELETE_CHUNK: usize = 500;

/// Durable backend over a single SQLite database
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file
    ///
    /// `call_timeout` bounds how long any single call waits on a locked database.
    pub fn open(path: &Path, call_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(call_timeout)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating the schema if needed
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS abn_records (
            abn TEXT PRIMARY KEY,
            record_last_updated_date TEXT,
            abn_status TEXT,
            abn_status_from_date TEXT,
            entity_type_ind TEXT,
            entity_type_text TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS main_entity (
            abn TEXT PRIMARY KEY REFERENCES abn_records(abn),
            type TEXT,
            text TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS legal_entity (
            abn TEXT PRIMARY KEY REFERENCES abn_records(abn),
            type TEXT,
            title TEXT,
            given_name_1 TEXT,
            given_name_2 TEXT,
            family_name TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS asic_numbers (
            abn TEXT PRIMARY KEY REFERENCES abn_records(abn),
            asic_number TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS gst_registrations (
            abn TEXT PRIMARY KEY REFERENCES abn_records(abn),
            status TEXT,
            status_from_date TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS business_addresses (
            abn TEXT PRIMARY KEY REFERENCES abn_records(abn),
            state_code TEXT,
            postcode TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS dgr_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            abn TEXT NOT NULL REFERENCES abn_records(abn),
            status_from_date TEXT,
            status TEXT,
            type TEXT,
            text TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS other_entity_names (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            abn TEXT NOT NULL REFERENCES abn_records(abn),
            type TEXT,
            text TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_dgr_entries_abn ON dgr_entries(abn);
        CREATE INDEX IF NOT EXISTS idx_other_entity_names_abn ON other_entity_names(abn);
        CREATE INDEX IF NOT EXISTS idx_main_entity_text ON main_entity(text);",
    )?;

    Ok(())
}

impl TableStore for SqliteStore {
    fn upsert(&mut self, table: Table, rows: &[Row], conflict_key: &str) -> Result<usize, StoreError> {
        table.check_conflict_key(conflict_key)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = row_columns(table, rows)?;
        let mut sql = insert_sql(table, &columns);

        let updates: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != conflict_key)
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .chain(
                (table == Table::AbnRecords)
                    .then(|| "updated_at = CURRENT_TIMESTAMP".to_string()),
            )
            .collect();

        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT(\"{conflict_key}\") DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT(\"{conflict_key}\") DO UPDATE SET {}",
                updates.join(", ")
            ));
        }

        let written = self.write_rows(&sql, &columns, rows)?;
        debug!(table = %table, rows = written, "Upserted rows");
        Ok(written)
    }

    fn insert(&mut self, table: Table, rows: &[Row]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = row_columns(table, rows)?;
        let sql = insert_sql(table, &columns);

        let written = self.write_rows(&sql, &columns, rows)?;
        debug!(table = %table, rows = written, "Inserted rows");
        Ok(written)
    }

    fn delete_in(&mut self, table: Table, column: &str, values: &[String]) -> Result<usize, StoreError> {
        table.check_column(column)?;
        if values.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        for chunk in values.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM \"{}\" WHERE \"{}\" IN ({})",
                table.name(),
                column,
                placeholders
            );
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;

        debug!(table = %table, rows = deleted, "Deleted rows");
        Ok(deleted)
    }
}

impl SqliteStore {
    /// Execute `sql` once per row inside a single transaction
    fn write_rows(&mut self, sql: &str, columns: &[String], rows: &[Row]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(sql)?;
            for row in rows {
                let values = columns
                    .iter()
                    .map(|c| to_sql_value(row.get(c)))
                    .collect::<Result<Vec<_>, _>>()?;
                stmt.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

fn insert_sql(table: Table, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table.name(),
        names.join(", "),
        placeholders.join(", ")
    )
}

fn to_sql_value(value: Option<&serde_json::Value>) -> Result<SqlValue, StoreError> {
    use serde_json::Value;

    Ok(match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(serde_json::to_string(other)?),
    })
}
