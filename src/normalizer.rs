// Record Normalizer
// Pure mapping from one ABR node to Option<NormalizedRecord>.
// A bad or missing ABN is a silent skip; structural problems are logged and skipped.

use thiserror::Error;
use tracing::{debug, warn};

use crate::node::RecordNode;
use crate::record::{
    normalize_abn, AbnIdentity, AlternateName, BusinessAddress, ConcessionEntry,
    IndividualName, NormalizedRecord, OrganizationName, TaxRegistration,
};

/// Local name of the per-entity record element
pub const RECORD_ELEMENT: &str = "ABR";

/// Structural problems that make a single record unusable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("expected <{expected}> element, found <{found}>")]
    UnexpectedElement { expected: String, found: String },

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Normalize one record; never fails past this boundary
pub fn normalize<N: RecordNode>(node: &N) -> Option<NormalizedRecord> {
    match try_normalize(node) {
        Ok(record) => record,
        Err(e) => {
            warn!(element = node.name(), error = %e, "Skipping structurally invalid record");
            None
        }
    }
}

/// Normalize one record, reporting structural failures instead of logging them
///
/// `Ok(None)` means the record was skipped for a missing/invalid ABN.
pub fn try_normalize<N: RecordNode>(node: &N) -> Result<Option<NormalizedRecord>, NormalizeError> {
    if node.name() != RECORD_ELEMENT {
        return Err(NormalizeError::UnexpectedElement {
            expected: RECORD_ELEMENT.to_string(),
            found: node.name().to_string(),
        });
    }

    let Some(identity) = identity(node) else {
        debug!("Skipping record without a valid ABN");
        return Ok(None);
    };

    let main_entity = node.child("MainEntity");
    let legal_entity = node.child("LegalEntity");

    let mut record = NormalizedRecord::new(identity);
    record.organization_name = main_entity
        .and_then(|e| e.child("NonIndividualName"))
        .map(organization_name);
    record.individual_name = legal_entity
        .and_then(|e| e.child("IndividualName"))
        .map(individual_name);
    record.address = business_address(main_entity, legal_entity);
    record.external_registration_number = owned(node.child_text("ASICNumber"));
    record.tax_registration = node.child("GST").map(|gst| TaxRegistration {
        status: owned(gst.attribute("status")),
        status_from_date: owned(gst.attribute("GSTStatusFromDate")),
    });
    record.concession_entries = non_empty(node.children("DGR").map(concession_entry).collect());
    record.alternate_names = non_empty(
        node.children("OtherEntity")
            .filter_map(|other| other.child("NonIndividualName"))
            .map(|name| {
                let org = organization_name(name);
                AlternateName {
                    name_type: org.name_type,
                    text: org.text,
                }
            })
            .collect(),
    );

    Ok(Some(record))
}

fn identity<N: RecordNode>(node: &N) -> Option<AbnIdentity> {
    let abn_elem = node.child("ABN")?;
    let abn = normalize_abn(abn_elem.text()?)?;

    let entity_type = node.child("EntityType");
    Some(AbnIdentity {
        abn,
        status: owned(abn_elem.attribute("status")),
        status_from_date: owned(abn_elem.attribute("ABNStatusFromDate")),
        record_last_updated: owned(node.attribute("recordLastUpdatedDate")),
        entity_type_code: owned(entity_type.and_then(|e| e.child_text("EntityTypeInd"))),
        entity_type_text: owned(entity_type.and_then(|e| e.child_text("EntityTypeText"))),
    })
}

fn organization_name<N: RecordNode>(name: &N) -> OrganizationName {
    OrganizationName {
        name_type: owned(name.attribute("type")),
        text: owned(name.child_text("NonIndividualNameText")),
    }
}

fn individual_name<N: RecordNode>(individual: &N) -> IndividualName {
    let mut given = individual.children("GivenName").map(|g| owned(g.text()));
    IndividualName {
        name_type: owned(individual.attribute("type")),
        title: owned(individual.child_text("NameTitle")),
        given_name_1: given.next().flatten(),
        given_name_2: given.next().flatten(),
        family_name: owned(individual.child_text("FamilyName")),
    }
}

/// Organisation address wins; fall back to the individual's only when absent
fn business_address<N: RecordNode>(main_entity: Option<&N>, legal_entity: Option<&N>) -> Option<BusinessAddress> {
    let block = main_entity
        .and_then(|e| e.child("BusinessAddress"))
        .or_else(|| legal_entity.and_then(|e| e.child("BusinessAddress")))?;

    let details = block.child("AddressDetails")?;
    Some(BusinessAddress {
        state_code: owned(details.child_text("State")),
        postcode: owned(details.child_text("Postcode")),
    })
}

fn concession_entry<N: RecordNode>(dgr: &N) -> ConcessionEntry {
    let name = dgr.child("NonIndividualName").map(organization_name);
    let (name_type, text) = match name {
        Some(org) => (org.name_type, org.text),
        None => (None, None),
    };
    ConcessionEntry {
        status_from_date: owned(dgr.attribute("DGRStatusFromDate")),
        status: owned(dgr.attribute("status")),
        name_type,
        text,
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
