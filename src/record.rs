// Canonical record shape
// One NormalizedRecord per ABR entry; every sub-entity is keyed by the ABN on persist.

use serde::{Deserialize, Serialize};

/// Length of a valid Australian Business Number
pub const ABN_LENGTH: usize = 11;

/// Core registry identity (always present)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnIdentity {
    pub abn: String,
    pub status: Option<String>,
    pub status_from_date: Option<String>,
    pub record_last_updated: Option<String>,
    pub entity_type_code: Option<String>,
    pub entity_type_text: Option<String>,
}

/// Organisation (non-individual) main name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationName {
    pub name_type: Option<String>,
    pub text: Option<String>,
}

/// Individual legal-entity name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualName {
    pub name_type: Option<String>,
    pub title: Option<String>,
    pub given_name_1: Option<String>,
    pub given_name_2: Option<String>,
    pub family_name: Option<String>,
}

impl IndividualName {
    /// "Given Given Family" with absent parts left out
    pub fn display_name(&self) -> String {
        [&self.given_name_1, &self.given_name_2, &self.family_name]
            .iter()
            .filter_map(|part| part.as_deref())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// GST registration status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegistration {
    pub status: Option<String>,
    pub status_from_date: Option<String>,
}

/// Deductible gift recipient entry (time-boxed special registration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcessionEntry {
    pub status_from_date: Option<String>,
    pub status: Option<String>,
    pub name_type: Option<String>,
    pub text: Option<String>,
}

/// Other (trading/business) name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateName {
    pub name_type: Option<String>,
    pub text: Option<String>,
}

/// Business address summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessAddress {
    pub state_code: Option<String>,
    pub postcode: Option<String>,
}

/// NormalizedRecord - the unit the rest of the pipeline works on
///
/// Absent sub-structures are `None`; repeated children are `None` rather than
/// an empty Vec so the persister can skip them cheaply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub identity: AbnIdentity,
    pub organization_name: Option<OrganizationName>,
    pub individual_name: Option<IndividualName>,
    pub external_registration_number: Option<String>,
    pub tax_registration: Option<TaxRegistration>,
    pub concession_entries: Option<Vec<ConcessionEntry>>,
    pub alternate_names: Option<Vec<AlternateName>>,
    pub address: Option<BusinessAddress>,
}

impl NormalizedRecord {
    /// Record with only the mandatory identity
    pub fn new(identity: AbnIdentity) -> Self {
        NormalizedRecord {
            identity,
            organization_name: None,
            individual_name: None,
            external_registration_number: None,
            tax_registration: None,
            concession_entries: None,
            alternate_names: None,
            address: None,
        }
    }

    pub fn abn(&self) -> &str {
        &self.identity.abn
    }
}

/// Strip all whitespace and accept only an 11-digit identifier
pub fn normalize_abn(raw: &str) -> Option<String> {
    let abn: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if abn.len() == ABN_LENGTH && abn.chars().all(|c| c.is_ascii_digit()) {
        Some(abn)
    } else {
        None
    }
}
