//! Hybrid KEM and signature primitives
//!
//! The KEM side pairs an ML-KEM-1024 encapsulation with an X25519
//! exchange; the signature side pairs ML-DSA-87 with Ed25519. Both
//! shares of a hybrid operation must succeed for the operation to
//! succeed.

use ed25519_dalek::{Signer, Verifier};
use pqcrypto_mldsa::mldsa87;
use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as KemPublicKeyT, SharedSecret as _,
};
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as SigPublicKeyT,
};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hashes::blake2b_256;
use crate::{PeerId, Result};

/// ML-KEM-1024 public key length (FIPS 203).
pub const MLKEM_PUBLIC_KEY_BYTES: usize = 1568;
/// ML-KEM-1024 ciphertext length (FIPS 203).
pub const MLKEM_CIPHERTEXT_BYTES: usize = 1568;
/// ML-DSA-87 public key length (FIPS 204).
pub const MLDSA_PUBLIC_KEY_BYTES: usize = 2592;
/// ML-DSA-87 detached signature length (FIPS 204).
pub const MLDSA_SIGNATURE_BYTES: usize = 4627;
/// Ed25519 public key length.
pub const ED25519_PUBLIC_KEY_BYTES: usize = 32;
/// Ed25519 signature length.
pub const ED25519_SIGNATURE_BYTES: usize = 64;

/// Serialized hybrid verify key: ML-DSA-87 public key followed by Ed25519.
pub const HYBRID_VERIFY_KEY_BYTES: usize = MLDSA_PUBLIC_KEY_BYTES + ED25519_PUBLIC_KEY_BYTES;
/// Serialized hybrid signature: ML-DSA-87 signature followed by Ed25519.
pub const HYBRID_SIGNATURE_BYTES: usize = MLDSA_SIGNATURE_BYTES + ED25519_SIGNATURE_BYTES;

/// Shared secrets produced by one hybrid KEM round.
///
/// Callers concatenate `mlkem || x25519` as HKDF input key material.
/// Both halves are wiped when the value is dropped.
pub struct SharedSecrets {
    pub mlkem: Zeroizing<[u8; 32]>,
    pub x25519: Zeroizing<[u8; 32]>,
}

impl SharedSecrets {
    /// Input key material for HKDF: `mlkem_shared || x25519_shared`.
    pub fn ikm(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(self.mlkem.as_ref());
        out[32..].copy_from_slice(self.x25519.as_ref());
        out
    }
}

/// Ephemeral hybrid KEM key pair, generated per handshake.
///
/// Held by the handshake initiator between its first message and the
/// peer's response; dropped (and the X25519 scalar wiped) as soon as the
/// shared secrets are derived.
pub struct HybridKemKeys {
    mlkem_public: mlkem1024::PublicKey,
    mlkem_secret: mlkem1024::SecretKey,
    x25519_secret: x25519_dalek::StaticSecret,
    x25519_public: x25519_dalek::PublicKey,
}

/// Public half of a [`HybridKemKeys`], as carried in handshake messages.
#[derive(Clone)]
pub struct HybridKemPublic {
    pub mlkem: Vec<u8>,
    pub x25519: [u8; 32],
}

/// Responder's share of a hybrid KEM round: the ML-KEM ciphertext plus
/// the responder's X25519 public key.
#[derive(Clone)]
pub struct HybridKemResponse {
    pub mlkem_ciphertext: Vec<u8>,
    pub x25519: [u8; 32],
}

impl HybridKemKeys {
    /// Generate a fresh ephemeral key pair from OS randomness.
    pub fn generate() -> Self {
        let (mlkem_public, mlkem_secret) = mlkem1024::keypair();
        let x25519_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let x25519_public = x25519_dalek::PublicKey::from(&x25519_secret);
        Self {
            mlkem_public,
            mlkem_secret,
            x25519_secret,
            x25519_public,
        }
    }

    pub fn public(&self) -> HybridKemPublic {
        HybridKemPublic {
            mlkem: self.mlkem_public.as_bytes().to_vec(),
            x25519: self.x25519_public.to_bytes(),
        }
    }

    /// Responder side: encapsulate to the initiator's public half.
    ///
    /// Generates the responder's own ephemeral X25519 pair internally and
    /// consumes it; the returned [`HybridKemResponse`] travels back to the
    /// initiator.
    pub fn encapsulate_to(peer: &HybridKemPublic) -> Result<(HybridKemResponse, SharedSecrets)> {
        if peer.mlkem.len() != MLKEM_PUBLIC_KEY_BYTES {
            return Err(CryptoError::malformed("mlkem_public_key", "wrong length"));
        }
        let mlkem_pk = mlkem1024::PublicKey::from_bytes(&peer.mlkem)
            .map_err(|_| CryptoError::malformed("mlkem_public_key", "rejected by kem"))?;
        let (mlkem_shared, ciphertext) = mlkem1024::encapsulate(&mlkem_pk);

        let eph_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let eph_public = x25519_dalek::PublicKey::from(&eph_secret);
        let dh = eph_secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer.x25519));

        let mut mlkem_out = Zeroizing::new([0u8; 32]);
        mlkem_out.copy_from_slice(mlkem_shared.as_bytes());

        Ok((
            HybridKemResponse {
                mlkem_ciphertext: ciphertext.as_bytes().to_vec(),
                x25519: eph_public.to_bytes(),
            },
            SharedSecrets {
                mlkem: mlkem_out,
                x25519: Zeroizing::new(dh.to_bytes()),
            },
        ))
    }

    /// Initiator side: recover the shared secrets from the responder's
    /// ciphertext and X25519 public key.
    pub fn decapsulate(&self, response: &HybridKemResponse) -> Result<SharedSecrets> {
        if response.mlkem_ciphertext.len() != MLKEM_CIPHERTEXT_BYTES {
            return Err(CryptoError::malformed("mlkem_ciphertext", "wrong length"));
        }
        let ciphertext = mlkem1024::Ciphertext::from_bytes(&response.mlkem_ciphertext)
            .map_err(|_| CryptoError::malformed("mlkem_ciphertext", "rejected by kem"))?;
        let mlkem_shared = mlkem1024::decapsulate(&ciphertext, &self.mlkem_secret);

        let dh = self
            .x25519_secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(response.x25519));

        let mut mlkem_out = Zeroizing::new([0u8; 32]);
        mlkem_out.copy_from_slice(mlkem_shared.as_bytes());

        Ok(SharedSecrets {
            mlkem: mlkem_out,
            x25519: Zeroizing::new(dh.to_bytes()),
        })
    }
}

/// Long-lived hybrid signing identity: ML-DSA-87 plus Ed25519.
///
/// The private halves never leave the process; [`crate::keys`] provides
/// the on-disk serialization.
#[derive(Clone)]
pub struct HybridSigningKey {
    pub(crate) mldsa_public: mldsa87::PublicKey,
    pub(crate) mldsa_secret: mldsa87::SecretKey,
    pub(crate) ed25519: ed25519_dalek::SigningKey,
}

/// Public half of a [`HybridSigningKey`].
#[derive(Clone)]
pub struct HybridVerifyKey {
    mldsa: mldsa87::PublicKey,
    ed25519: ed25519_dalek::VerifyingKey,
}

/// Detached hybrid signature: both algorithm outputs over the same message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridSignature {
    pub mldsa: Vec<u8>,
    pub ed25519: [u8; 64],
}

impl HybridSigningKey {
    pub fn generate() -> Self {
        let (mldsa_public, mldsa_secret) = mldsa87::keypair();
        let ed25519 = ed25519_dalek::SigningKey::generate(&mut OsRng);
        Self {
            mldsa_public,
            mldsa_secret,
            ed25519,
        }
    }

    /// Sign with both halves. Infallible for in-memory keys.
    pub fn sign(&self, message: &[u8]) -> HybridSignature {
        let mldsa = mldsa87::detached_sign(message, &self.mldsa_secret);
        let ed25519 = self.ed25519.sign(message);
        HybridSignature {
            mldsa: mldsa.as_bytes().to_vec(),
            ed25519: ed25519.to_bytes(),
        }
    }

    pub fn public(&self) -> HybridVerifyKey {
        HybridVerifyKey {
            mldsa: self.mldsa_public.clone(),
            ed25519: self.ed25519.verifying_key(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().peer_id()
    }
}

impl HybridVerifyKey {
    /// Verify both halves; either failing rejects the signature.
    pub fn verify(&self, message: &[u8], signature: &HybridSignature) -> Result<()> {
        if signature.mldsa.len() != MLDSA_SIGNATURE_BYTES {
            return Err(CryptoError::malformed("mldsa_signature", "wrong length"));
        }
        let mldsa_sig = mldsa87::DetachedSignature::from_bytes(&signature.mldsa)
            .map_err(|_| CryptoError::malformed("mldsa_signature", "rejected by verifier"))?;
        mldsa87::verify_detached_signature(&mldsa_sig, message, &self.mldsa)
            .map_err(|_| CryptoError::BadSignature)?;

        let ed_sig = ed25519_dalek::Signature::from_bytes(&signature.ed25519);
        self.ed25519
            .verify(message, &ed_sig)
            .map_err(|_| CryptoError::BadSignature)?;

        Ok(())
    }

    /// Serialized form: ML-DSA-87 public key followed by Ed25519 public key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_VERIFY_KEY_BYTES);
        out.extend_from_slice(self.mldsa.as_bytes());
        out.extend_from_slice(self.ed25519.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HYBRID_VERIFY_KEY_BYTES {
            return Err(CryptoError::malformed("hybrid_verify_key", "wrong length"));
        }
        let (mldsa_bytes, ed_bytes) = bytes.split_at(MLDSA_PUBLIC_KEY_BYTES);
        let mldsa = mldsa87::PublicKey::from_bytes(mldsa_bytes)
            .map_err(|_| CryptoError::malformed("hybrid_verify_key", "bad ml-dsa half"))?;
        let mut ed_arr = [0u8; 32];
        ed_arr.copy_from_slice(ed_bytes);
        let ed25519 = ed25519_dalek::VerifyingKey::from_bytes(&ed_arr)
            .map_err(|_| CryptoError::malformed("hybrid_verify_key", "bad ed25519 half"))?;
        Ok(Self { mldsa, ed25519 })
    }

    /// BLAKE2b-256 of the serialized key; stable across sessions.
    pub fn peer_id(&self) -> PeerId {
        blake2b_256(&self.to_bytes())
    }
}

impl HybridSignature {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HYBRID_SIGNATURE_BYTES);
        out.extend_from_slice(&self.mldsa);
        out.extend_from_slice(&self.ed25519);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HYBRID_SIGNATURE_BYTES {
            return Err(CryptoError::malformed("hybrid_signature", "wrong length"));
        }
        let (mldsa, ed) = bytes.split_at(MLDSA_SIGNATURE_BYTES);
        let mut ed25519 = [0u8; 64];
        ed25519.copy_from_slice(ed);
        Ok(Self {
            mldsa: mldsa.to_vec(),
            ed25519,
        })
    }
}
