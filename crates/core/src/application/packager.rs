// Result Packager
// Turns runner output locations into a signed, time-limited manifest

use crate::domain::{Manifest, ManifestEntry, ObjectLocation};
use crate::error::{ExportError, Result};
use crate::port::{ObjectStore, TimeProvider, UrlSigner};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ResultPackager {
    object_store: Arc<dyn ObjectStore>,
    signer: Arc<dyn UrlSigner>,
    time_provider: Arc<dyn TimeProvider>,
    url_ttl_ms: i64,
}

impl ResultPackager {
    /// Create a new packager
    ///
    /// # Arguments
    /// * `object_store` - Source of object size / content type
    /// * `signer` - Dedicated signing identity (never the job owner)
    /// * `time_provider` - Clock for URL expiry
    /// * `url_ttl_ms` - Lifetime of the signed URLs
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        signer: Arc<dyn UrlSigner>,
        time_provider: Arc<dyn TimeProvider>,
        url_ttl_ms: i64,
    ) -> Self {
        Self {
            object_store,
            signer,
            time_provider,
            url_ttl_ms,
        }
    }

    /// Build the manifest for a finished extraction
    ///
    /// Side-effect free: only metadata reads and signing.
    ///
    /// # Errors
    /// `ExportError::PackagingFailure` if any location is malformed, outside the
    /// signer bucket, or missing from storage
    pub async fn package(&self, output_locations: &[String], owner_id: &str) -> Result<Manifest> {
        let locations = parse_locations(output_locations)?;
        let expires_at = self.time_provider.now_millis() + self.url_ttl_ms;

        let heads = join_all(locations.iter().map(|loc| self.object_store.head(loc))).await;

        let mut entries = Vec::with_capacity(locations.len());
        for (location, head) in locations.iter().zip(heads) {
            let metadata = head.map_err(|e| {
                ExportError::PackagingFailure(format!("cannot read {}: {}", location, e))
            })?;
            let url = self.sign(location, expires_at)?;
            entries.push(ManifestEntry {
                url,
                content_type: metadata.content_type,
                size_bytes: metadata.size_bytes,
                resource_type: location.resource_type_hint(),
            });
        }

        let manifest = Manifest {
            entries,
            expires_at,
            signed_by: self.signer.identity().role.clone(),
        };

        info!(
            owner_id = %owner_id,
            files = manifest.entries.len(),
            total_bytes = manifest.total_size_bytes(),
            expires_at = expires_at,
            "Export results packaged"
        );

        Ok(manifest)
    }

    /// Re-sign an expired manifest without touching storage
    ///
    /// Entry order follows `output_locations`, which is the order the
    /// manifest was built in.
    pub fn refresh(&self, output_locations: &[String], manifest: &Manifest) -> Result<Manifest> {
        let locations = parse_locations(output_locations)?;
        if locations.len() != manifest.entries.len() {
            return Err(ExportError::PackagingFailure(format!(
                "manifest has {} entries for {} locations",
                manifest.entries.len(),
                locations.len()
            )));
        }

        let expires_at = self.time_provider.now_millis() + self.url_ttl_ms;
        let entries = locations
            .iter()
            .zip(&manifest.entries)
            .map(|(location, entry)| {
                Ok(ManifestEntry {
                    url: self.sign(location, expires_at)?,
                    ..entry.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(files = entries.len(), expires_at = expires_at, "Manifest URLs re-signed");

        Ok(Manifest {
            entries,
            expires_at,
            signed_by: self.signer.identity().role.clone(),
        })
    }

    fn sign(&self, location: &ObjectLocation, expires_at: i64) -> Result<String> {
        self.signer
            .sign(location, expires_at)
            .map_err(|e| ExportError::PackagingFailure(e.to_string()))
    }
}

fn parse_locations(output_locations: &[String]) -> Result<Vec<ObjectLocation>> {
    output_locations
        .iter()
        .map(|raw| {
            ObjectLocation::parse(raw).map_err(|e| ExportError::PackagingFailure(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NDJSON_CONTENT_TYPE;
    use crate::port::object_store::mocks::InMemoryObjectStore;
    use crate::port::object_store::MockObjectStore;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::url_signer::mocks::StaticUrlSigner;
    use crate::port::{ObjectMetadata, StorageError};

    fn packager(store: Arc<dyn ObjectStore>) -> ResultPackager {
        ResultPackager::new(
            store,
            Arc::new(StaticUrlSigner::new("results")),
            Arc::new(ManualClock::new(10_000)),
            3_600_000,
        )
    }

    #[tokio::test]
    async fn test_package_three_files_in_order() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert("results/job-1/Patient.ndjson", 100, NDJSON_CONTENT_TYPE);
        store.insert("results/job-1/Observation-1.ndjson", 200, NDJSON_CONTENT_TYPE);
        store.insert("results/job-1/Observation-2.ndjson", 300, NDJSON_CONTENT_TYPE);

        let locations = vec![
            "results/job-1/Patient.ndjson".to_string(),
            "results/job-1/Observation-1.ndjson".to_string(),
            "results/job-1/Observation-2.ndjson".to_string(),
        ];
        let manifest = packager(store).package(&locations, "alice").await.unwrap();

        assert_eq!(manifest.entries.len(), 3);
        assert_eq!(manifest.expires_at, 3_610_000);
        assert_eq!(manifest.total_size_bytes(), 600);
        assert_eq!(manifest.entries[0].resource_type.as_deref(), Some("Patient"));
        assert_eq!(manifest.entries[2].size_bytes, 300);
        assert!(manifest.entries[1].url.contains("Observation-1.ndjson"));
        assert_eq!(manifest.signed_by, "export-results-signer");
    }

    #[tokio::test]
    async fn test_location_outside_signer_bucket_fails() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert("private/job-1/Patient.ndjson", 100, NDJSON_CONTENT_TYPE);

        let err = packager(store)
            .package(&["private/job-1/Patient.ndjson".to_string()], "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::PackagingFailure(_)));
    }

    #[tokio::test]
    async fn test_missing_object_fails() {
        let mut store = MockObjectStore::new();
        store
            .expect_head()
            .times(1)
            .returning(|loc| Err(StorageError::NotFound(loc.to_string())));

        let err = packager(Arc::new(store))
            .package(&["results/job-1/Patient.ndjson".to_string()], "alice")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read results/job-1/Patient.ndjson"));
    }

    #[tokio::test]
    async fn test_storage_metadata_is_passed_through() {
        let mut store = MockObjectStore::new();
        store.expect_head().returning(|_| {
            Ok(ObjectMetadata {
                size_bytes: 42,
                content_type: "application/json".to_string(),
            })
        });

        let manifest = packager(Arc::new(store))
            .package(&["results/job-1/part-0.json".to_string()], "alice")
            .await
            .unwrap();
        assert_eq!(manifest.entries[0].content_type, "application/json");
        assert_eq!(manifest.entries[0].size_bytes, 42);
        assert_eq!(manifest.entries[0].resource_type, None);
    }

    #[tokio::test]
    async fn test_refresh_keeps_metadata_and_extends_expiry() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.insert("results/job-1/Patient.ndjson", 100, NDJSON_CONTENT_TYPE);
        let clock = Arc::new(ManualClock::new(10_000));
        let packager = ResultPackager::new(
            store,
            Arc::new(StaticUrlSigner::new("results")),
            clock.clone(),
            1_000,
        );

        let locations = vec!["results/job-1/Patient.ndjson".to_string()];
        let original = packager.package(&locations, "alice").await.unwrap();

        clock.advance(5_000);
        let refreshed = packager.refresh(&locations, &original).unwrap();

        assert_eq!(refreshed.expires_at, 16_000);
        assert_eq!(refreshed.entries[0].size_bytes, 100);
        assert_ne!(refreshed.entries[0].url, original.entries[0].url);
    }
}
