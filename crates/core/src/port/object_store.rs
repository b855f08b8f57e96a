// Result Object Store Port

use crate::domain::ObjectLocation;
use async_trait::async_trait;
use thiserror::Error;

/// Metadata of a stored result object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    pub content_type: String,
}

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage IO error: {0}")]
    Io(String),
}

/// Object storage holding export results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read object metadata without fetching content
    async fn head(&self, location: &ObjectLocation) -> Result<ObjectMetadata, StorageError>;

    /// Delete every object under `bucket/prefix`
    ///
    /// # Returns
    /// Number of objects deleted (0 if the prefix is already gone)
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, StorageError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory object store keyed by `bucket/key`
    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<BTreeMap<String, ObjectMetadata>>,
    }

    impl InMemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, location: impl Into<String>, size_bytes: u64, content_type: &str) {
            self.objects.lock().unwrap().insert(
                location.into(),
                ObjectMetadata {
                    size_bytes,
                    content_type: content_type.to_string(),
                },
            );
        }

        pub fn contains(&self, location: &str) -> bool {
            self.objects.lock().unwrap().contains_key(location)
        }

        pub fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn head(&self, location: &ObjectLocation) -> Result<ObjectMetadata, StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(&location.to_string())
                .cloned()
                .ok_or_else(|| StorageError::NotFound(location.to_string()))
        }

        async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, StorageError> {
            let full_prefix = format!("{}/{}", bucket, prefix);
            let mut objects = self.objects.lock().unwrap();
            let before = objects.len();
            objects.retain(|location, _| !location.starts_with(&full_prefix));
            Ok(before - objects.len())
        }
    }
}
