//! Ethernet and encrypted frame encodings
//!
//! Ethernet frames are validated by length only; the EtherType is carried
//! but never interpreted. The encrypted frame header is fixed-width:
//! `session_id(16) || counter(8, big-endian) || aead_output`.

use crate::error::{Result, TunnelError};
use crate::types::SessionId;

/// Ethernet header: destination MAC, source MAC, EtherType.
pub const ETH_HEADER_LEN: usize = 14;
/// Largest payload a standard (non-jumbo) frame carries.
pub const ETH_MAX_PAYLOAD: usize = 1500;

/// Fixed header length of an encrypted frame on the wire.
pub const ENCRYPTED_HEADER_LEN: usize = 16 + 8;
/// Poly1305 authentication tag length appended by the AEAD.
pub const AEAD_TAG_LEN: usize = 16;

/// A parsed layer-2 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Parse a raw frame, validating length bounds only.
    pub fn parse(bytes: &[u8], mtu: u16) -> Result<Self> {
        validate_frame_len(bytes.len(), mtu)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&bytes[0..6]);
        src.copy_from_slice(&bytes[6..12]);
        let ethertype = u16::from_be_bytes([bytes[12], bytes[13]]);
        Ok(Self {
            dst,
            src,
            ethertype,
            payload: bytes[ETH_HEADER_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ETH_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.dst);
        out.extend_from_slice(&self.src);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Total frame length on the wire.
    pub fn wire_len(&self) -> usize {
        ETH_HEADER_LEN + self.payload.len()
    }
}

/// Check a raw frame length against `[header, mtu + header]`.
pub fn validate_frame_len(len: usize, mtu: u16) -> Result<()> {
    if len < ETH_HEADER_LEN || len > mtu as usize + ETH_HEADER_LEN {
        return Err(TunnelError::MalformedFrame(len));
    }
    Ok(())
}

/// One encrypted frame as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedFrame {
    pub session_id: SessionId,
    pub counter: u64,
    /// AEAD output: ciphertext followed by the 16-byte tag.
    pub payload: Vec<u8>,
}

impl EncryptedFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCRYPTED_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // Smallest valid frame carries at least the AEAD tag.
        if bytes.len() < ENCRYPTED_HEADER_LEN + AEAD_TAG_LEN {
            return Err(TunnelError::MalformedFrame(bytes.len()));
        }
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&bytes[0..16]);
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&bytes[16..24]);
        Ok(Self {
            session_id,
            counter: u64::from_be_bytes(counter_bytes),
            payload: bytes[ENCRYPTED_HEADER_LEN..].to_vec(),
        })
    }
}
