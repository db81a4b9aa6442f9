//! Wire records carried as WebSocket binary payloads
//!
//! Every payload is a typed record: a 4-byte big-endian length, a 1-byte
//! record tag, then the body. Handshake and re-handshake bodies are
//! bincode with big-endian fixed-width integers; encrypted frames use
//! their own fixed header (see [`crate::frame`]). The relay forwards
//! records opaquely, except that it fills the `peer_address` field of
//! CONFIRM and ESTABLISHED records it forwards — which is why those
//! fields are excluded from the signatures.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{HandshakeError, Result, TunnelError};
use crate::frame::EncryptedFrame;
use crate::types::{PeerAddress, SessionId};

use crypto::PeerId;

const TAG_HANDSHAKE: u8 = 0x01;
const TAG_REHANDSHAKE: u8 = 0x02;
const TAG_FRAME: u8 = 0x03;

/// Upper bound on a single record; handshake messages dominate and stay
/// well under this.
const MAX_RECORD_LEN: usize = 64 * 1024;

fn wire_bincode() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_RECORD_LEN as u64)
}

/// Serialize a message body with the wire's bincode profile.
pub fn encode_body<M: Serialize>(message: &M) -> Result<Vec<u8>> {
    Ok(wire_bincode().serialize(message)?)
}

/// Deserialize a message body with the wire's bincode profile.
pub fn decode_body<M: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    Ok(wire_bincode().deserialize(bytes)?)
}

/// Handshake records exchanged through the relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Init(InitMessage),
    Response(ResponseMessage),
    Confirm(ConfirmMessage),
    Established(EstablishedMessage),
}

impl HandshakeMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            HandshakeMessage::Init(_) => "INIT",
            HandshakeMessage::Response(_) => "RESPONSE",
            HandshakeMessage::Confirm(_) => "CONFIRM",
            HandshakeMessage::Established(_) => "ESTABLISHED",
        }
    }
}

/// Initiator's opening message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitMessage {
    pub client_id: PeerId,
    /// Hybrid public signing key (ML-DSA-87 || Ed25519)
    pub verify_key: Vec<u8>,
    /// Ephemeral ML-KEM-1024 public key
    pub mlkem_public: Vec<u8>,
    /// Ephemeral X25519 public key
    pub x25519_public: [u8; 32],
    pub nonce: [u8; 16],
    /// Hybrid signature over all preceding fields
    pub signature: Vec<u8>,
}

/// Responder's reply: encapsulation plus the responder-chosen session id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub client_id: PeerId,
    pub verify_key: Vec<u8>,
    pub mlkem_ciphertext: Vec<u8>,
    pub x25519_public: [u8; 32],
    pub nonce: [u8; 16],
    pub session_id: SessionId,
    /// Hybrid signature over all preceding fields and the initiator's nonce
    pub signature: Vec<u8>,
}

/// Initiator's confirmation, binding the derived shared secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmMessage {
    pub session_id: SessionId,
    /// Unix seconds; checked against +/- 60 s skew
    pub timestamp: u64,
    /// Initiator's direct-listener advertisement, if it runs one
    pub direct: Option<DirectAdvertisement>,
    /// Sender's public address as observed by the relay; relay-filled,
    /// not signed
    pub peer_address: Option<PeerAddress>,
    /// Recipient's own public address as observed by the relay;
    /// relay-filled, not signed
    pub observed_address: Option<PeerAddress>,
    /// Hybrid signature over session id, responder nonce, shared-secret
    /// hash, timestamp and the advertisement
    pub signature: Vec<u8>,
}

/// Responder's final message with the negotiated session parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstablishedMessage {
    pub session_id: SessionId,
    pub timestamp: u64,
    pub mtu: u16,
    pub heartbeat_secs: u32,
    pub key_rotation_secs: u32,
    pub supports_direct_p2p: bool,
    /// Responder's direct-listener advertisement
    pub direct: Option<DirectAdvertisement>,
    /// Sender's public address as observed by the relay; relay-filled,
    /// not signed
    pub peer_address: Option<PeerAddress>,
    /// Recipient's own public address as observed by the relay;
    /// relay-filled, not signed
    pub observed_address: Option<PeerAddress>,
    /// Hint for simultaneous-open timing, milliseconds from receipt
    pub punch_delay_ms: u32,
    /// Hybrid signature over every field except the relay-filled
    /// addresses, bound to the initiator's nonce
    pub signature: Vec<u8>,
}

/// A direct listener advertisement: where to dial and what to pin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectAdvertisement {
    pub listen_port: u16,
    /// Self-signed certificate DER
    pub cert_der: Vec<u8>,
    /// Hybrid countersignature over the DER
    pub cert_signature: Vec<u8>,
    pub not_before: u64,
    pub not_after: u64,
    /// Advertiser's NAT classification, feeding the feasibility check
    pub nat_type: Option<crate::nat::NatType>,
}

/// Re-handshake records carried over a freshly established direct channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RehandshakeMessage {
    Request(RehandshakeRequest),
    Response(RehandshakeResponse),
    Complete(RehandshakeComplete),
}

impl RehandshakeMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            RehandshakeMessage::Request(_) => "REQUEST",
            RehandshakeMessage::Response(_) => "RESPONSE",
            RehandshakeMessage::Complete(_) => "COMPLETE",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RehandshakeRequest {
    pub session_id: SessionId,
    pub nonce: [u8; 32],
    pub timestamp: u64,
    pub hmac: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RehandshakeResponse {
    pub nonce: [u8; 32],
    /// Echo of the request nonce, proving freshness
    pub echo_nonce: [u8; 32],
    pub timestamp: u64,
    pub hmac: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RehandshakeComplete {
    pub hmac: [u8; 32],
}

/// In-band key rotation: a fresh hybrid KEM round signed by both
/// identities, carried encrypted under the current epoch's keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RekeyInitMessage {
    pub epoch: u32,
    pub mlkem_public: Vec<u8>,
    pub x25519_public: [u8; 32],
    pub nonce: [u8; 16],
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RekeyAckMessage {
    pub epoch: u32,
    pub mlkem_ciphertext: Vec<u8>,
    pub x25519_public: [u8; 32],
    pub nonce: [u8; 16],
    pub signature: Vec<u8>,
}

/// Kind byte carried as the first plaintext byte inside every encrypted
/// frame, multiplexing user data and in-tunnel control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Ping,
    Pong,
    RekeyInit,
    RekeyAck,
    DirectActive,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ping => 1,
            FrameKind::Pong => 2,
            FrameKind::RekeyInit => 3,
            FrameKind::RekeyAck => 4,
            FrameKind::DirectActive => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => FrameKind::Data,
            1 => FrameKind::Ping,
            2 => FrameKind::Pong,
            3 => FrameKind::RekeyInit,
            4 => FrameKind::RekeyAck,
            5 => FrameKind::DirectActive,
            _ => return None,
        })
    }
}

/// A decoded wire record.
#[derive(Clone, Debug)]
pub enum Record {
    Handshake(HandshakeMessage),
    Rehandshake(RehandshakeMessage),
    Frame(EncryptedFrame),
}

/// Encode a record: `len(4, big-endian) || tag(1) || body`.
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let (tag, body) = match record {
        Record::Handshake(msg) => (TAG_HANDSHAKE, encode_body(msg)?),
        Record::Rehandshake(msg) => (TAG_REHANDSHAKE, encode_body(msg)?),
        Record::Frame(frame) => (TAG_FRAME, frame.encode()),
    };
    let len = (body.len() + 1) as u32;
    let mut out = Vec::with_capacity(4 + 1 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a record produced by [`encode_record`].
pub fn decode_record(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < 5 {
        return Err(TunnelError::MalformedFrame(bytes.len()));
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len == 0 || len > MAX_RECORD_LEN || bytes.len() != 4 + len {
        return Err(TunnelError::MalformedFrame(bytes.len()));
    }
    let tag = bytes[4];
    let body = &bytes[5..];
    match tag {
        TAG_HANDSHAKE => Ok(Record::Handshake(decode_body(body)?)),
        TAG_REHANDSHAKE => Ok(Record::Rehandshake(decode_body(body)?)),
        TAG_FRAME => Ok(Record::Frame(EncryptedFrame::decode(body)?)),
        _ => Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
            expected: "known record tag",
            got: "unknown",
        })),
    }
}
