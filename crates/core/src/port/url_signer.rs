// URL Signer Port
// Issues time-limited download URLs under a dedicated signing identity

use crate::domain::ObjectLocation;
use thiserror::Error;

/// Identity used for signing, distinct from any job owner
///
/// The identity may only read from `bucket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub role: String,
    pub bucket: String,
    pub key_id: String,
}

impl SigningIdentity {
    pub fn can_read(&self, location: &ObjectLocation) -> bool {
        location.bucket == self.bucket
    }
}

/// Signing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Location {location} is outside signer bucket {bucket}")]
    OutOfScope { location: String, bucket: String },

    #[error("Signing key error: {0}")]
    Key(String),
}

/// Signs result locations into bearer download URLs
pub trait UrlSigner: Send + Sync {
    fn identity(&self) -> &SigningIdentity;

    /// Produce a URL for `location` valid until `expires_at` (epoch ms)
    ///
    /// # Errors
    /// `SigningError::OutOfScope` when the location is outside the signer bucket
    fn sign(&self, location: &ObjectLocation, expires_at: i64) -> Result<String, SigningError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;

    /// Signer producing readable fake URLs, scoped like the real one
    pub struct StaticUrlSigner {
        identity: SigningIdentity,
    }

    impl StaticUrlSigner {
        pub fn new(bucket: impl Into<String>) -> Self {
            Self {
                identity: SigningIdentity {
                    role: "export-results-signer".to_string(),
                    bucket: bucket.into(),
                    key_id: "test-key".to_string(),
                },
            }
        }
    }

    impl UrlSigner for StaticUrlSigner {
        fn identity(&self) -> &SigningIdentity {
            &self.identity
        }

        fn sign(&self, location: &ObjectLocation, expires_at: i64) -> Result<String, SigningError> {
            if !self.identity.can_read(location) {
                return Err(SigningError::OutOfScope {
                    location: location.to_string(),
                    bucket: self.identity.bucket.clone(),
                });
            }
            Ok(format!(
                "https://signed.test/{}?expires={}",
                location, expires_at
            ))
        }
    }
}
