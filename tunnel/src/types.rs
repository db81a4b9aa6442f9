//! Shared type definitions for the tunnel core

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crypto::{HybridVerifyKey, PeerId};

/// Session identifier, chosen by the handshake responder.
pub type SessionId = [u8; 16];

/// Which side of the session handshake this endpoint played. Fixed for
/// the session lifetime; key directions are oriented by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Network address published by the relay in its ESTABLISHED exchange.
/// IPv4 addresses are stored v4-mapped so the wire layout is fixed-width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: [u8; 16],
    pub port: u16,
    pub ipv6: bool,
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                ip: v4.ip().to_ipv6_mapped().octets(),
                port: v4.port(),
                ipv6: false,
            },
            SocketAddr::V6(v6) => Self {
                ip: v6.ip().octets(),
                port: v6.port(),
                ipv6: true,
            },
        }
    }
}

impl PeerAddress {
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        if self.ipv6 {
            SocketAddr::new(IpAddr::V6(v6), self.port)
        } else {
            let mapped = v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
            SocketAddr::new(IpAddr::V4(mapped), self.port)
        }
    }
}

/// A peer's pinned TLS certificate, anchored in its post-quantum identity.
///
/// `pq_signature` is the hybrid countersignature over `der`; pinning
/// checks both the exact DER bytes and this signature, never a CA chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinnedCert {
    pub der: Vec<u8>,
    pub pq_signature: Vec<u8>,
    pub not_before: u64,
    pub not_after: u64,
    pub peer_id: PeerId,
}

/// Everything learned about the remote peer during the handshake.
#[derive(Clone)]
pub struct RemotePeer {
    pub peer_id: PeerId,
    pub verify_key: HybridVerifyKey,
    /// Public address observed by the relay, if it published one.
    pub address: Option<PeerAddress>,
    pub supports_direct: bool,
    /// Direct-listener port and pinned certificate, if the peer runs one.
    pub direct_port: Option<u16>,
    pub pinned_cert: Option<PinnedCert>,
    /// Peer's NAT classification, when its advertisement carried one.
    pub nat_type: Option<crate::nat::NatType>,
}

/// Negotiated session parameters carried in the ESTABLISHED message.
#[derive(Clone, Copy, Debug)]
pub struct Negotiated {
    pub mtu: u16,
    pub heartbeat_interval: Duration,
    pub key_rotation_interval: Duration,
}

/// Keys and parameters for one session epoch.
///
/// Peer A's `tx_key` equals peer B's `rx_key` and vice versa; both are
/// wiped on drop (clones included). The session outlives any single
/// transport.
#[derive(Clone)]
pub struct SessionKeys {
    pub session_id: SessionId,
    pub tx_key: Zeroizing<[u8; 32]>,
    pub rx_key: Zeroizing<[u8; 32]>,
    pub mtu: u16,
    pub heartbeat_interval: Duration,
    pub key_rotation_interval: Duration,
    pub created_at: SystemTime,
}

const INFO_I2R: &[u8] = b"sm/tx/i2r";
const INFO_R2I: &[u8] = b"sm/tx/r2i";

/// AEAD nonce direction tag for initiator-to-responder traffic.
pub const DIR_TAG_I2R: [u8; 4] = *b"i2r\0";
/// AEAD nonce direction tag for responder-to-initiator traffic.
pub const DIR_TAG_R2I: [u8; 4] = *b"r2i\0";

impl SessionKeys {
    /// Derive directional keys from the hybrid shared secrets.
    ///
    /// `ikm` is `mlkem_shared || x25519_shared`; the session id salts the
    /// HKDF so re-keying with fresh secrets under the same id still
    /// separates epochs by input material.
    pub fn derive(session_id: SessionId, ikm: &[u8], role: Role, negotiated: Negotiated) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(&session_id), ikm);

        let mut i2r = Zeroizing::new([0u8; 32]);
        let mut r2i = Zeroizing::new([0u8; 32]);
        hk.expand(INFO_I2R, i2r.as_mut())
            .expect("okm length is valid");
        hk.expand(INFO_R2I, r2i.as_mut())
            .expect("okm length is valid");

        let (tx_key, rx_key) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };

        Self {
            session_id,
            tx_key,
            rx_key,
            mtu: negotiated.mtu,
            heartbeat_interval: negotiated.heartbeat_interval,
            key_rotation_interval: negotiated.key_rotation_interval,
            created_at: SystemTime::now(),
        }
    }

    /// Nonce direction tag for frames this endpoint sends.
    pub fn tx_tag(&self, role: Role) -> [u8; 4] {
        match role {
            Role::Initiator => DIR_TAG_I2R,
            Role::Responder => DIR_TAG_R2I,
        }
    }

    /// Nonce direction tag for frames this endpoint receives.
    pub fn rx_tag(&self, role: Role) -> [u8; 4] {
        match role {
            Role::Initiator => DIR_TAG_R2I,
            Role::Responder => DIR_TAG_I2R,
        }
    }

    /// Largest plaintext the pipeline will seal: MTU plus Ethernet header.
    pub fn max_plaintext(&self) -> usize {
        self.mtu as usize + crate::frame::ETH_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated() -> Negotiated {
        Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn peer_address_round_trips_v4_and_v6() {
        let v4: SocketAddr = "203.0.113.9:4433".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:4433".parse().unwrap();
        assert_eq!(PeerAddress::from(v4).to_socket_addr(), v4);
        assert_eq!(PeerAddress::from(v6).to_socket_addr(), v6);
    }

    #[test]
    fn derived_directions_cross_between_roles() {
        let ikm = [7u8; 64];
        let sid = [1u8; 16];
        let a = SessionKeys::derive(sid, &ikm, Role::Initiator, negotiated());
        let b = SessionKeys::derive(sid, &ikm, Role::Responder, negotiated());

        assert_eq!(*a.tx_key, *b.rx_key);
        assert_eq!(*a.rx_key, *b.tx_key);
        assert_ne!(*a.tx_key, *a.rx_key);
        assert_eq!(a.tx_tag(Role::Initiator), b.rx_tag(Role::Responder));
    }

    #[test]
    fn different_session_ids_separate_keys() {
        let ikm = [9u8; 64];
        let a = SessionKeys::derive([1u8; 16], &ikm, Role::Initiator, negotiated());
        let b = SessionKeys::derive([2u8; 16], &ikm, Role::Initiator, negotiated());
        assert_ne!(*a.tx_key, *b.tx_key);
    }
}
