//! Shared metadata validation used by both the Conversion Agent and
//! the Conversation Agent, which perform the same checks from the
//! internal and user-facing sides respectively.

use chrono::DateTime;

use crate::errors::ValidationError;
use crate::session::UserMetadata;

/// Species names accepted without an LLM round-trip. A production
/// deployment would load this from
/// the NCBI taxonomy; a short allowlist is sufficient for the core's scope.
pub const APPROVED_SPECIES: &[&str] = &[
    "Mus musculus",
    "Rattus norvegicus",
    "Homo sapiens",
    "Macaca mulatta",
    "Drosophila melanogaster",
    "Danio rerio",
];

/// Validate the presence and format of the four required fields, returning
/// a normalized copy. The first violation found is
/// raised — callers re-prompt one field at a time.
pub fn validate_required_metadata(metadata: &UserMetadata) -> Result<UserMetadata, ValidationError> {
    let subject_id = require_field(&metadata.subject_id, "subject_id")?;
    if !subject_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "subject_id".to_string(),
            reason: "must be alphanumeric (underscores allowed)".to_string(),
        });
    }

    let species = require_field(&metadata.species, "species")?;
    if !APPROVED_SPECIES.contains(&species.as_str()) {
        return Err(ValidationError::NotInTaxonomy {
            field: "species".to_string(),
            value: species.clone(),
        });
    }

    let session_description = require_field(&metadata.session_description, "session_description")?;
    if session_description.trim().is_empty() {
        return Err(ValidationError::InvalidFormat {
            field: "session_description".to_string(),
            reason: "must not be empty".to_string(),
        });
    }

    let session_start_time = require_field(&metadata.session_start_time, "session_start_time")?;
    if DateTime::parse_from_rfc3339(&session_start_time).is_err() {
        return Err(ValidationError::InvalidFormat {
            field: "session_start_time".to_string(),
            reason: "must be an ISO-8601 UTC timestamp".to_string(),
        });
    }

    Ok(metadata.clone())
}

fn require_field(value: &Option<String>, field: &str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(ValidationError::MissingField {
            field: field.to_string(),
        }),
    }
}

/// Validate a single field in isolation, for `receive_user_input`'s
/// per-field re-prompting.
pub fn validate_single_field(field_name: &str, value: &str) -> Result<(), ValidationError> {
    match field_name {
        "subject_id" => {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField { field: field_name.to_string() });
            }
            if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ValidationError::InvalidFormat {
                    field: field_name.to_string(),
                    reason: "must be alphanumeric (underscores allowed)".to_string(),
                });
            }
            Ok(())
        }
        "species" => {
            if !APPROVED_SPECIES.contains(&value) {
                return Err(ValidationError::NotInTaxonomy {
                    field: field_name.to_string(),
                    value: value.to_string(),
                });
            }
            Ok(())
        }
        "session_description" => {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField { field: field_name.to_string() });
            }
            Ok(())
        }
        "session_start_time" => {
            if DateTime::parse_from_rfc3339(value).is_err() {
                return Err(ValidationError::InvalidFormat {
                    field: field_name.to_string(),
                    reason: "must be an ISO-8601 UTC timestamp".to_string(),
                });
            }
            Ok(())
        }
        // Optional fields (experimenter, institution, lab, age, sex, weight)
        // accept any non-empty value.
        _ => {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField { field: field_name.to_string() });
            }
            Ok(())
        }
    }
}
