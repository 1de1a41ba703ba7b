// Read-side queries over the SQLite store
// Rebuilds NormalizedRecords from the per-table rows and backs the search API.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::StoreError;
use crate::record::{
    normalize_abn, AbnIdentity, AlternateName, BusinessAddress, ConcessionEntry, IndividualName,
    NormalizedRecord, OrganizationName, TaxRegistration,
};
use crate::store::Table;

/// Upper bound on search results
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Registration status as shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityStatus {
    Active,
    Cancelled,
    Inactive,
}

impl EntityStatus {
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("ACT") => EntityStatus::Active,
            Some("CAN") => EntityStatus::Cancelled,
            _ => EntityStatus::Inactive,
        }
    }
}

/// Search result row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySummary {
    pub abn: String,
    pub name: String,
    pub entity_type: Option<String>,
    pub status: EntityStatus,
    pub registered_from: Option<String>,
    pub gst_registered: bool,
    pub gst_registered_from: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
}

impl EntitySummary {
    pub fn from_record(record: &NormalizedRecord) -> Self {
        let gst = record.tax_registration.as_ref();
        let gst_registered = gst.is_some_and(|g| g.status.as_deref() == Some("ACT"));
        EntitySummary {
            abn: record.identity.abn.clone(),
            name: display_name(record),
            entity_type: record.identity.entity_type_text.clone(),
            status: EntityStatus::from_code(record.identity.status.as_deref()),
            registered_from: record.identity.status_from_date.clone(),
            gst_registered,
            gst_registered_from: gst
                .filter(|_| gst_registered)
                .and_then(|g| g.status_from_date.clone()),
            state: record.address.as_ref().and_then(|a| a.state_code.clone()),
            postcode: record.address.as_ref().and_then(|a| a.postcode.clone()),
        }
    }
}

/// Organisation name, else the individual's name, else the first other name
pub fn display_name(record: &NormalizedRecord) -> String {
    if let Some(text) = record.organization_name.as_ref().and_then(|o| o.text.clone()) {
        return text;
    }
    if let Some(person) = &record.individual_name {
        let name = person.display_name();
        if !name.is_empty() {
            return name;
        }
    }
    record
        .alternate_names
        .iter()
        .flatten()
        .find_map(|n| n.text.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Row count of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    pub table: String,
    pub rows: i64,
}

/// Full stored entity for `abn`, or `None` when it was never ingested
pub fn lookup(conn: &Connection, abn: &str) -> Result<Option<NormalizedRecord>, StoreError> {
    let Some(abn) = normalize_abn(abn) else {
        return Ok(None);
    };

    let identity = conn
        .query_row(
            "SELECT abn, abn_status, abn_status_from_date, record_last_updated_date,
                    entity_type_ind, entity_type_text
             FROM abn_records WHERE abn = ?1",
            params![abn],
            |row| {
                Ok(AbnIdentity {
                    abn: row.get(0)?,
                    status: row.get(1)?,
                    status_from_date: row.get(2)?,
                    record_last_updated: row.get(3)?,
                    entity_type_code: row.get(4)?,
                    entity_type_text: row.get(5)?,
                })
            },
        )
        .optional()?;
    let Some(identity) = identity else {
        return Ok(None);
    };

    let mut record = NormalizedRecord::new(identity);

    record.organization_name = conn
        .query_row(
            "SELECT type, text FROM main_entity WHERE abn = ?1",
            params![abn],
            |row| {
                Ok(OrganizationName {
                    name_type: row.get(0)?,
                    text: row.get(1)?,
                })
            },
        )
        .optional()?;

    record.individual_name = conn
        .query_row(
            "SELECT type, title, given_name_1, given_name_2, family_name
             FROM legal_entity WHERE abn = ?1",
            params![abn],
            |row| {
                Ok(IndividualName {
                    name_type: row.get(0)?,
                    title: row.get(1)?,
                    given_name_1: row.get(2)?,
                    given_name_2: row.get(3)?,
                    family_name: row.get(4)?,
                })
            },
        )
        .optional()?;

    record.external_registration_number = conn
        .query_row(
            "SELECT asic_number FROM asic_numbers WHERE abn = ?1",
            params![abn],
            |row| row.get(0),
        )
        .optional()?;

    record.tax_registration = conn
        .query_row(
            "SELECT status, status_from_date FROM gst_registrations WHERE abn = ?1",
            params![abn],
            |row| {
                Ok(TaxRegistration {
                    status: row.get(0)?,
                    status_from_date: row.get(1)?,
                })
            },
        )
        .optional()?;

    record.address = conn
        .query_row(
            "SELECT state_code, postcode FROM business_addresses WHERE abn = ?1",
            params![abn],
            |row| {
                Ok(BusinessAddress {
                    state_code: row.get(0)?,
                    postcode: row.get(1)?,
                })
            },
        )
        .optional()?;

    let mut stmt = conn.prepare(
        "SELECT status_from_date, status, type, text FROM dgr_entries WHERE abn = ?1 ORDER BY id",
    )?;
    let entries = stmt
        .query_map(params![abn], |row| {
            Ok(ConcessionEntry {
                status_from_date: row.get(0)?,
                status: row.get(1)?,
                name_type: row.get(2)?,
                text: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    record.concession_entries = (!entries.is_empty()).then_some(entries);

    let mut stmt = conn.prepare("SELECT type, text FROM other_entity_names WHERE abn = ?1 ORDER BY id")?;
    let names = stmt
        .query_map(params![abn], |row| {
            Ok(AlternateName {
                name_type: row.get(0)?,
                text: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    record.alternate_names = (!names.is_empty()).then_some(names);

    Ok(Some(record))
}

/// Find entities by ABN or by name
///
/// An 11-digit query (whitespace ignored) is an exact ABN lookup. Anything
/// else matches case-insensitively anywhere in organisation, other or
/// individual names.
pub fn search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<EntitySummary>, StoreError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    if normalize_abn(query).is_some() {
        return Ok(lookup(conn, query)?
            .map(|record| EntitySummary::from_record(&record))
            .into_iter()
            .collect());
    }

    let pattern = format!("%{}%", escape_like(query));
    let limit = limit.clamp(1, MAX_SEARCH_LIMIT) as i64;

    let mut stmt = conn.prepare(
        "SELECT r.abn FROM abn_records r
         WHERE r.abn IN (
             SELECT abn FROM main_entity WHERE text LIKE ?1 ESCAPE '\\'
             UNION
             SELECT abn FROM other_entity_names WHERE text LIKE ?1 ESCAPE '\\'
             UNION
             SELECT abn FROM legal_entity
             WHERE TRIM(COALESCE(given_name_1, '') || ' ' || COALESCE(given_name_2, '') || ' ' || COALESCE(family_name, ''))
                   LIKE ?1 ESCAPE '\\'
                OR (COALESCE(given_name_1, '') || ' ' || COALESCE(family_name, '')) LIKE ?1 ESCAPE '\\'
         )
         ORDER BY r.abn
         LIMIT ?2",
    )?;
    let abns = stmt
        .query_map(params![pattern, limit], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(abns.len());
    for abn in abns {
        if let Some(record) = lookup(conn, &abn)? {
            results.push(EntitySummary::from_record(&record));
        }
    }
    Ok(results)
}

/// Rows per table, in schema order
pub fn table_counts(conn: &Connection) -> Result<Vec<TableCount>, StoreError> {
    Table::ALL
        .iter()
        .map(|table| {
            let rows: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", table.name()),
                [],
                |row| row.get(0),
            )?;
            Ok(TableCount {
                table: table.name().to_string(),
                rows,
            })
        })
        .collect()
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
