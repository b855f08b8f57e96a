// Export request model (FHIR Bulk Data $export parameters)

use super::error::{DomainError, Result};
use super::manifest::NDJSON_CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Accepted spellings of the ndjson `_outputFormat`
const NDJSON_ALIASES: [&str; 3] = [NDJSON_CONTENT_TYPE, "application/ndjson", "ndjson"];

/// FHIR ids are 1-64 chars of `[A-Za-z0-9\-.]`
const MAX_FHIR_ID_LEN: usize = 64;

/// What the export covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExportScope {
    /// Every resource on the server (requires the system export grant)
    System,
    /// Patient compartment(s); `None` means all patients
    Patient { patient_id: Option<String> },
    /// Members of a Group resource
    Group { group_id: String },
}

impl ExportScope {
    pub fn is_system(&self) -> bool {
        matches!(self, ExportScope::System)
    }
}

impl std::fmt::Display for ExportScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportScope::System => f.write_str("system"),
            ExportScope::Patient { patient_id: None } => f.write_str("Patient"),
            ExportScope::Patient {
                patient_id: Some(id),
            } => write!(f, "Patient/{}", id),
            ExportScope::Group { group_id } => write!(f, "Group/{}", group_id),
        }
    }
}

impl FromStr for ExportScope {
    type Err = DomainError;

    /// Parse `system`, `Patient`, `Patient/{id}` or `Group/{id}`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("system") {
            return Ok(ExportScope::System);
        }
        if s == "Patient" {
            return Ok(ExportScope::Patient { patient_id: None });
        }

        match s.split_once('/') {
            Some(("Patient", id)) => {
                validate_fhir_id(id)?;
                Ok(ExportScope::Patient {
                    patient_id: Some(id.to_string()),
                })
            }
            Some(("Group", id)) => {
                validate_fhir_id(id)?;
                Ok(ExportScope::Group {
                    group_id: id.to_string(),
                })
            }
            _ => Err(DomainError::InvalidRequest(format!(
                "unsupported export scope '{}'",
                s
            ))),
        }
    }
}

fn validate_fhir_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_FHIR_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidRequest(format!("invalid resource id '{}'", id)))
    }
}

/// Export request: scope plus filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub scope: ExportScope,
    /// `_type` filter; empty means every type
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// `_since` (epoch ms): only resources changed at or after this instant
    pub since: Option<i64>,
    /// Upper bound of the change window (epoch ms)
    pub until: Option<i64>,
    /// `_outputFormat`, normalized to the ndjson content type
    pub output_format: String,
}

impl ExportRequest {
    pub fn new(scope: ExportScope) -> Self {
        Self {
            scope,
            resource_types: Vec::new(),
            since: None,
            until: None,
            output_format: NDJSON_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_resource_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    /// Normalize the output format, de-duplicate `_type` and validate.
    ///
    /// # Errors
    /// `DomainError::InvalidRequest` for unknown formats, malformed type
    /// names, or an inverted / future change window.
    pub fn normalized(mut self, now: i64) -> Result<Self> {
        let format = self.output_format.trim();
        if !NDJSON_ALIASES.iter().any(|alias| alias.eq_ignore_ascii_case(format)) {
            return Err(DomainError::InvalidRequest(format!(
                "unsupported _outputFormat '{}'",
                self.output_format
            )));
        }
        self.output_format = NDJSON_CONTENT_TYPE.to_string();

        let mut types: Vec<String> = Vec::with_capacity(self.resource_types.len());
        for raw in &self.resource_types {
            let name = raw.trim();
            if !is_resource_type_name(name) {
                return Err(DomainError::InvalidRequest(format!(
                    "invalid resource type '{}'",
                    raw
                )));
            }
            if !types.iter().any(|t| t == name) {
                types.push(name.to_string());
            }
        }
        self.resource_types = types;

        if let Some(since) = self.since {
            if since > now {
                return Err(DomainError::InvalidRequest(
                    "_since must not be in the future".to_string(),
                ));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(DomainError::InvalidRequest(
                    "_since must not be after the end of the window".to_string(),
                ));
            }
        }

        Ok(self)
    }
}

fn is_resource_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase()) && chars.all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parsing() {
        assert_eq!("system".parse::<ExportScope>().unwrap(), ExportScope::System);
        assert_eq!(
            "Patient".parse::<ExportScope>().unwrap(),
            ExportScope::Patient { patient_id: None }
        );
        assert_eq!(
            "Patient/123".parse::<ExportScope>().unwrap(),
            ExportScope::Patient {
                patient_id: Some("123".to_string())
            }
        );
        assert_eq!(
            "Group/cohort-7".parse::<ExportScope>().unwrap(),
            ExportScope::Group {
                group_id: "cohort-7".to_string()
            }
        );
        assert_eq!("Patient/123".parse::<ExportScope>().unwrap().to_string(), "Patient/123");
    }

    #[test]
    fn test_scope_rejects_unknown_forms() {
        for bad in ["Encounter/1", "Group", "Group/", "Patient/a b", "Patient/../x/"] {
            assert!(bad.parse::<ExportScope>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_normalized_request() {
        let req = ExportRequest::new(ExportScope::System)
            .with_resource_types(["Patient", " Observation", "Patient"])
            .with_output_format("ndjson")
            .with_since(500)
            .normalized(1_000)
            .unwrap();

        assert_eq!(req.resource_types, vec!["Patient", "Observation"]);
        assert_eq!(req.output_format, NDJSON_CONTENT_TYPE);
    }

    #[test]
    fn test_invalid_requests() {
        let base = || ExportRequest::new(ExportScope::System);

        assert!(base().with_output_format("text/csv").normalized(0).is_err());
        assert!(base().with_resource_types(["patient"]).normalized(0).is_err());
        assert!(base().with_resource_types(["Pat1ent"]).normalized(0).is_err());
        assert!(base().with_since(2_000).normalized(1_000).is_err());
        assert!(base().with_since(500).with_until(100).normalized(1_000).is_err());
    }

    #[test]
    fn test_scope_serde_shape() {
        let json = serde_json::to_value(ExportScope::Group {
            group_id: "g1".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "group", "group_id": "g1"}));
    }
}
