// Result manifest and object locations

use super::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

/// Content type of FHIR bulk data files
pub const NDJSON_CONTENT_TYPE: &str = "application/fhir+ndjson";

/// One downloadable result file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Signed, time-limited download URL
    pub url: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// FHIR resource type contained in the file, when derivable from its name
    pub resource_type: Option<String>,
}

/// Ordered list of signed result locations handed to the job owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    /// All URLs stop working at this instant (epoch ms)
    pub expires_at: i64,
    /// Signing identity that produced the URLs
    pub signed_by: String,
}

impl Manifest {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

/// Reference to an object in result storage: `<bucket>/<key>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `bucket/key`, rejecting empty parts and path traversal
    pub fn parse(location: &str) -> Result<Self> {
        let (bucket, key) = location
            .split_once('/')
            .ok_or_else(|| DomainError::InvalidLocation(location.to_string()))?;

        let dot_segment = |segment: &str| segment == "." || segment == "..";
        if bucket.is_empty()
            || dot_segment(bucket)
            || key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|segment| dot_segment(segment) || segment.is_empty())
        {
            return Err(DomainError::InvalidLocation(location.to_string()));
        }

        Ok(Self::new(bucket, key))
    }

    /// File name component of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Resource type from bulk-data file naming (`Patient.ndjson`, `Observation-2.ndjson`)
    pub fn resource_type_hint(&self) -> Option<String> {
        let name = self.file_name();
        let stem = name.split(['.', '-']).next()?;
        let mut chars = stem.chars();
        let first = chars.next()?;
        if first.is_ascii_uppercase() && chars.all(|c| c.is_ascii_alphanumeric()) {
            Some(stem.to_string())
        } else {
            None
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = ObjectLocation::parse("results/job-1/Patient-1.ndjson").unwrap();
        assert_eq!(loc.bucket, "results");
        assert_eq!(loc.key, "job-1/Patient-1.ndjson");
        assert_eq!(loc.file_name(), "Patient-1.ndjson");
        assert_eq!(loc.resource_type_hint().as_deref(), Some("Patient"));
        assert_eq!(loc.to_string(), "results/job-1/Patient-1.ndjson");
    }

    #[test]
    fn test_parse_rejects_bad_locations() {
        for bad in ["", "results", "results/", "/key", "results/../etc/passwd", "b//k", "../job-1/a.ndjson", "results/./a"] {
            assert!(ObjectLocation::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_resource_type_hint_requires_type_name() {
        let loc = ObjectLocation::parse("results/job-1/part-0000.ndjson").unwrap();
        assert_eq!(loc.resource_type_hint(), None);
    }

    #[test]
    fn test_manifest_expiry() {
        let manifest = Manifest {
            entries: vec![],
            expires_at: 100,
            signed_by: "signer".into(),
        };
        assert!(!manifest.is_expired(99));
        assert!(manifest.is_expired(100));
    }
}
