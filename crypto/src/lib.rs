//! Hybrid post-quantum cryptography for ShadowMesh
//!
//! Every asymmetric operation in ShadowMesh pairs a post-quantum algorithm
//! with a classical one, so security holds as long as either remains
//! unbroken:
//!
//! - Key exchange: ML-KEM-1024 encapsulation combined with X25519 ECDH
//! - Authentication: ML-DSA-87 signatures combined with Ed25519
//!
//! Peer identifiers are BLAKE2b-256 digests of the hybrid public signing
//! key and are stable for as long as the key material is, which is why
//! [`keys`] provides a real, versioned serializer instead of regenerating
//! keys per boot.

pub mod error;
pub mod hashes;
pub mod hybrid;
pub mod keys;

pub use error::CryptoError;
pub use hybrid::{
    HybridKemKeys, HybridKemPublic, HybridKemResponse, HybridSignature, HybridSigningKey,
    HybridVerifyKey, SharedSecrets,
};

/// Peer identifier: BLAKE2b-256 of the hybrid public signing key.
pub type PeerId = [u8; 32];

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
