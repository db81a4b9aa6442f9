//! ShadowMesh client tunnel core
//!
//! Drives an authenticated, encrypted layer-2 tunnel between two
//! endpoints: a hybrid post-quantum handshake over an untrusted relay, a
//! full-duplex AEAD datapath between a TAP device and a WebSocket, and a
//! live migration of the session onto a direct TLS connection when the
//! network allows, falling back to the relay when it does not.
//!
//! The moving parts, leaves first:
//!
//! - [`tap`]: the layer-2 device and its frame pumps
//! - [`pipeline`]: per-direction AEAD with monotone counters
//! - [`transport`]: WebSocket channels and their task pairs
//! - [`handshake`] / [`rehandshake`]: session establishment and the
//!   HMAC proof that binds a new transport to a live session
//! - [`manager`]: the loops that own TAP, pipeline and active transport
//! - [`direct`]: listener, pinned dialer, migration and fallback
//! - [`service`]: one call that wires a running tunnel together
//!
//! Sessions survive transport swaps: keys are never re-derived and
//! counters never reset during migration, so the peer sees one monotone
//! sequence regardless of the path frames took.

pub mod config;
pub mod direct;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod manager;
pub mod nat;
pub mod pipeline;
pub mod rehandshake;
pub mod relay;
pub mod service;
pub mod state;
pub mod tap;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use service::TunnelService;
pub use state::ConnState;
pub use telemetry::StatsSnapshot;
pub use types::{PeerAddress, Role, SessionKeys};
