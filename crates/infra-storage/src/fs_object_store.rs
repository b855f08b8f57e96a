// Filesystem ObjectStore: `<root>/<bucket>/<key>`

use async_trait::async_trait;
use fhir_export_core::domain::{ObjectLocation, NDJSON_CONTENT_TYPE};
use fhir_export_core::port::{ObjectMetadata, ObjectStore, StorageError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result objects stored as plain files, one directory per bucket
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_segments(raw: &str, path: &str) -> Result<(), StorageError> {
        if raw
            .split('/')
            .any(|segment| segment == ".." || segment == "." || segment.contains('\\'))
        {
            return Err(StorageError::Io(format!("refusing path outside root: {}", path)));
        }
        Ok(())
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(StorageError::Io(format!("invalid bucket '{}'", bucket)));
        }
        Self::check_segments(bucket, bucket)?;
        Ok(self.root.join(bucket))
    }

    fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let bucket_dir = self.bucket_dir(&location.bucket)?;
        Self::check_segments(&location.key, &location.to_string())?;
        Ok(bucket_dir.join(&location.key))
    }

    fn content_type(path: &Path) -> &'static str {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ndjson") => NDJSON_CONTENT_TYPE,
            Some("json") => "application/json",
            _ => "application/octet-stream",
        }
    }

    async fn count_files(dir: &Path) -> std::io::Result<usize> {
        let mut count = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.display().to_string())
    } else {
        StorageError::Io(format!("{}: {}", path.display(), err))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head(&self, location: &ObjectLocation) -> Result<ObjectMetadata, StorageError> {
        let path = self.path_for(location)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        if !metadata.is_file() {
            return Err(StorageError::NotFound(location.to_string()));
        }

        Ok(ObjectMetadata {
            size_bytes: metadata.len(),
            content_type: Self::content_type(&path).to_string(),
        })
    }

    /// `prefix` names a directory inside the bucket (`job-1/`)
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, StorageError> {
        let dir_name = prefix.trim_end_matches('/');
        if dir_name.is_empty() || dir_name.starts_with('/') {
            return Err(StorageError::Io(format!(
                "refusing to delete prefix '{}' in bucket {}",
                prefix, bucket
            )));
        }
        Self::check_segments(dir_name, prefix)?;
        let dir = self.bucket_dir(bucket)?.join(dir_name);

        let count = match Self::count_files(&dir).await {
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&dir, e)),
        };

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&dir, e)),
        }

        debug!(bucket = %bucket, prefix = %prefix, deleted = count, "Deleted result prefix");
        Ok(count)
    }
}
