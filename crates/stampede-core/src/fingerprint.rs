//! Request fingerprinting using SHA-256.

use crate::error::FingerprintError;
use crate::request::{RequestBody, RequestDescriptor};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain tag mixed into every digest so keys never collide with other
/// SHA-256 uses of the same bytes.
const DOMAIN_TAG: &[u8] = b"stampede/dedup-key/v1";

/// Canonical identity of a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// Creates a key from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the key as a hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Derives a [`DedupKey`] from a request.
///
/// Implementations must be pure: the same descriptor always yields the same key.
pub trait Fingerprinter: Send + Sync {
    /// Computes the dedup key for `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request body could not be read or the path is
    /// malformed. The engine then executes the request without coalescing.
    fn fingerprint(&self, request: &RequestDescriptor) -> Result<DedupKey, FingerprintError>;
}

/// Default fingerprinter.
///
/// Hashes a length-prefixed canonical encoding of method, path, sorted query
/// pairs and, for body-bearing methods, the raw body bytes. Bodies are never
/// parsed: byte-identical bodies coalesce, anything else does not.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Sha256Fingerprinter {
    /// Creates a new fingerprinter.
    pub fn new() -> Self {
        Self
    }
}

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, request: &RequestDescriptor) -> Result<DedupKey, FingerprintError> {
        let path = request.path();
        if path.is_empty() || !path.starts_with('/') || path.contains('\0') {
            return Err(FingerprintError::InvalidPath(path.to_string()));
        }

        let mut hasher = Sha256::new();
        write_field(&mut hasher, DOMAIN_TAG);
        write_field(&mut hasher, request.method().as_str().as_bytes());
        write_field(&mut hasher, path.as_bytes());

        let mut query: Vec<(&str, &str)> = request
            .query()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.sort_unstable();

        hasher.update((query.len() as u64).to_be_bytes());
        for (key, value) in query {
            write_field(&mut hasher, key.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }

        // Read-only methods tolerate inert bodies; only an unreadable body on a
        // body-bearing method prevents fingerprinting.
        if request.method().carries_body() {
            match request.body() {
                RequestBody::Absent => hasher.update([0u8]),
                RequestBody::Bytes(bytes) => {
                    hasher.update([1u8]);
                    write_field(&mut hasher, bytes);
                }
                RequestBody::Unreadable(reason) => {
                    return Err(FingerprintError::UnreadableBody(reason.clone()));
                }
            }
        } else {
            hasher.update([0u8]);
        }

        Ok(DedupKey(hasher.finalize().into()))
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
