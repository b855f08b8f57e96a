// HMAC-SHA256 URL signer
// reason: hmac + sha2 keyed digests, hex for the query-string form

use fhir_export_core::domain::ObjectLocation;
use fhir_export_core::port::{SigningError, SigningIdentity, UrlSigner};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs download URLs as `<base>/<bucket>/<key>?expires=..&key_id=..&signature=..`
///
/// The signature covers location, expiry and key id, so none of them can be
/// altered without invalidating the URL. Only objects in the identity's
/// bucket are signed.
pub struct HmacUrlSigner {
    identity: SigningIdentity,
    base_url: String,
    secret: Vec<u8>,
}

impl HmacUrlSigner {
    /// # Errors
    /// `SigningError::Key` for an empty secret
    pub fn new(
        identity: SigningIdentity,
        base_url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Result<Self, SigningError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(SigningError::Key("signing secret is empty".to_string()));
        }
        Ok(Self {
            identity,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        })
    }

    fn mac(&self, location: &ObjectLocation, expires_at: i64) -> Result<HmacSha256, SigningError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SigningError::Key(e.to_string()))?;
        mac.update(location.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(expires_at.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(self.identity.key_id.as_bytes());
        Ok(mac)
    }

    /// Check a signature produced by `sign`
    ///
    /// False when expired, out of scope, or tampered with.
    pub fn verify(
        &self,
        location: &ObjectLocation,
        expires_at: i64,
        signature: &str,
        now: i64,
    ) -> bool {
        if now >= expires_at || !self.identity.can_read(location) {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        match self.mac(location, expires_at) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

impl UrlSigner for HmacUrlSigner {
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

        let signature = hex::encode(self.mac(location, expires_at)?.finalize().into_bytes());
        let key_path: Vec<String> = location
            .key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        Ok(format!(
            "{}/{}/{}?expires={}&key_id={}&signature={}",
            self.base_url,
            urlencoding::encode(&location.bucket),
            key_path.join("/"),
            expires_at,
            urlencoding::encode(&self.identity.key_id),
            signature
        ))
    }
}
