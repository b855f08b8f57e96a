// FHIR Export Infrastructure - Result Storage
// Implements: ObjectStore (local filesystem buckets), UrlSigner (HMAC-SHA256)

mod fs_object_store;
mod hmac_signer;

pub use fs_object_store::FsObjectStore;
pub use hmac_signer::HmacUrlSigner;
