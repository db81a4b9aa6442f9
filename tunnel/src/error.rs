//! Error taxonomy for the tunnel core
//!
//! Fatal errors terminate the tunnel and surface one structured event;
//! recoverable errors drive state transitions and are logged at `warn`.
//! Decrypt failures are deliberately absent from the log path: they are
//! counted and dropped so the peer gains no oracle.

use thiserror::Error;

use crate::state::ConnState;

/// Errors surfaced by the tunnel core.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid configuration; rejected before anything starts
    #[error("config error: {0}")]
    Config(String),

    /// TAP device failure. Fatal on creation, recoverable on transient I/O
    #[error("tap device error: {0}")]
    Tap(String),

    /// Cryptographic failure indicating a logic bug or corrupted state
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Peer authentication failed (signature or HMAC); fatal for this peer
    #[error("authentication failure: {0}")]
    Auth(&'static str),

    /// Presented certificate does not match the pin
    #[error("certificate pin mismatch: {0}")]
    Pin(&'static str),

    /// Transport-level failure; drives the Reconnecting state
    #[error("transport error: {0}")]
    Transport(String),

    /// Direct connectivity is not possible for this NAT pairing
    #[error("direct path infeasible: {0}")]
    NatInfeasible(&'static str),

    /// An operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    /// Send-side saturation; callers apply flow control, never drop
    #[error("transport backpressure")]
    Backpressure,

    /// Frame failed length validation; counted and dropped
    #[error("malformed frame: {0} bytes")]
    MalformedFrame(usize),

    /// Message referenced a session other than the live one
    #[error("session id mismatch")]
    SessionMismatch,

    /// The send counter crossed the rotation threshold
    #[error("key rotation required")]
    KeyRotationRequired,

    /// The send counter reached its hard limit with rotation unavailable
    #[error("frame counter exhausted")]
    CounterExhausted,

    /// Session keys have been released
    #[error("session closed")]
    SessionClosed,

    /// Disallowed state machine transition
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ConnState, to: ConnState },

    /// Handshake protocol violation
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake-specific failures; all fatal for the current attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid signature on {0}")]
    InvalidSignature(&'static str),

    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("client id does not match presented key")]
    ClientIdMismatch,

    #[error("peer is not the configured peer")]
    UnexpectedPeer,

    #[error("shared secret confirmation mismatch")]
    SecretMismatch,

    #[error("timestamp skew exceeds tolerance")]
    ClockSkew,

    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error("invalid handshake state")]
    InvalidState,
}

/// Result alias used throughout the tunnel core.
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Whether this error terminates the tunnel (vs. driving a transition).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_)
                | TunnelError::Crypto(_)
                | TunnelError::Auth(_)
                | TunnelError::Pin(_)
                | TunnelError::CounterExhausted
                | TunnelError::SessionClosed
        )
    }
}
