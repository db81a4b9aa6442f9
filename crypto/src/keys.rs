//! Versioned serialization for the hybrid signing identity
//!
//! The blob layout is fixed-width so parsing is length-checked and
//! allocation-free: `magic(4) || version(1) || mldsa_pub || mldsa_sec ||
//! ed25519_sec`. Comparisons over serialized key material are
//! constant-time. A stable serialization is what keeps the derived
//! `client_id` identical across restarts.

use pqcrypto_mldsa::mldsa87;
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hybrid::HybridSigningKey;
use crate::Result;

const MAGIC: &[u8; 4] = b"SMK\x01";
const VERSION: u8 = 1;

/// ML-DSA-87 secret key length (FIPS 204).
const MLDSA_SECRET_KEY_BYTES: usize = 4896;
/// ML-DSA-87 public key length (FIPS 204).
const MLDSA_PUBLIC_KEY_BYTES: usize = 2592;
/// Ed25519 seed length.
const ED25519_SECRET_KEY_BYTES: usize = 32;

/// Total serialized length of a version-1 signing key blob.
pub const SIGNING_KEY_BLOB_BYTES: usize =
    4 + 1 + MLDSA_PUBLIC_KEY_BYTES + MLDSA_SECRET_KEY_BYTES + ED25519_SECRET_KEY_BYTES;

/// Serialize a [`HybridSigningKey`] into the versioned blob format.
///
/// The output contains private key material; callers own wiping and
/// at-rest protection. The buffer is returned wrapped in [`Zeroizing`]
/// so intermediate copies are cleared when dropped.
pub fn signing_key_to_bytes(key: &HybridSigningKey) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(SIGNING_KEY_BLOB_BYTES));
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(key.mldsa_public.as_bytes());
    out.extend_from_slice(key.mldsa_secret.as_bytes());
    out.extend_from_slice(key.ed25519.as_bytes());
    out
}

/// Parse a versioned signing key blob.
pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<HybridSigningKey> {
    if bytes.len() < 5 || &bytes[..4] != MAGIC {
        return Err(CryptoError::BadMagic);
    }
    if bytes[4] != VERSION {
        return Err(CryptoError::UnsupportedVersion(bytes[4]));
    }
    if bytes.len() != SIGNING_KEY_BLOB_BYTES {
        return Err(CryptoError::malformed("signing_key_blob", "wrong length"));
    }

    let mut offset = 5;
    let mldsa_public = mldsa87::PublicKey::from_bytes(&bytes[offset..offset + MLDSA_PUBLIC_KEY_BYTES])
        .map_err(|_| CryptoError::malformed("signing_key_blob", "bad ml-dsa public key"))?;
    offset += MLDSA_PUBLIC_KEY_BYTES;

    let mldsa_secret = mldsa87::SecretKey::from_bytes(&bytes[offset..offset + MLDSA_SECRET_KEY_BYTES])
        .map_err(|_| CryptoError::malformed("signing_key_blob", "bad ml-dsa secret key"))?;
    offset += MLDSA_SECRET_KEY_BYTES;

    let mut seed = Zeroizing::new([0u8; ED25519_SECRET_KEY_BYTES]);
    seed.copy_from_slice(&bytes[offset..offset + ED25519_SECRET_KEY_BYTES]);
    let ed25519 = ed25519_dalek::SigningKey::from_bytes(&seed);

    Ok(HybridSigningKey {
        mldsa_public,
        mldsa_secret,
        ed25519,
    })
}

/// Constant-time equality over two serialized key blobs.
pub fn blobs_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
