//! Error types for hybrid crypto operations

use thiserror::Error;

/// Errors from hybrid key exchange, signing and key serialization.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A public key, ciphertext or signature had the wrong length or encoding
    #[error("malformed {field}: {reason}")]
    Malformed {
        field: &'static str,
        reason: &'static str,
    },

    /// Signature verification failed (either hybrid half)
    #[error("signature verification failed")]
    BadSignature,

    /// Key serialization version is not supported
    #[error("unsupported key format version {0}")]
    UnsupportedVersion(u8),

    /// Key file magic did not match
    #[error("not a shadowmesh key blob")]
    BadMagic,
}

impl CryptoError {
    pub(crate) fn malformed(field: &'static str, reason: &'static str) -> Self {
        CryptoError::Malformed { field, reason }
    }
}
