//! Four-message handshake through an in-memory relay double.
//!
//! The relay forwards records opaquely and fills the observed-address
//! fields the way a real forwarding service would; a malicious variant
//! tampers with what it forwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::{Message, Role as WsRole};
use tokio_tungstenite::WebSocketStream;

use crypto::HybridSigningKey;
use shadowmesh_tunnel::error::TunnelError;
use shadowmesh_tunnel::handshake::{self, HandshakeConfig};
use shadowmesh_tunnel::transport::{ws_config, TransportKind, WsChannel};
use shadowmesh_tunnel::types::{Negotiated, PeerAddress, Role};
use shadowmesh_tunnel::wire::{decode_record, encode_record, HandshakeMessage, Record};

fn test_config(identity: Arc<HybridSigningKey>) -> HandshakeConfig {
    HandshakeConfig {
        client_id: identity.peer_id(),
        identity,
        negotiated: Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        },
        timeout: Duration::from_secs(10),
        direct: None,
        expected_peer: None,
        punch_delay: Duration::from_millis(20),
    }
}

fn addr_a() -> SocketAddr {
    "203.0.113.1:40001".parse().unwrap()
}

fn addr_b() -> SocketAddr {
    "203.0.113.2:40002".parse().unwrap()
}

/// Relay behavior: fill the unsigned address fields on forwarded CONFIRM
/// and ESTABLISHED records, exactly like a forwarding service that knows
/// both legs' remote endpoints.
fn relay_patch(payload: Vec<u8>, sender_addr: SocketAddr, recipient_addr: SocketAddr) -> Vec<u8> {
    match decode_record(&payload) {
        Ok(Record::Handshake(HandshakeMessage::Confirm(mut confirm))) => {
            confirm.peer_address = Some(PeerAddress::from(sender_addr));
            confirm.observed_address = Some(PeerAddress::from(recipient_addr));
            encode_record(&Record::Handshake(HandshakeMessage::Confirm(confirm))).unwrap()
        }
        Ok(Record::Handshake(HandshakeMessage::Established(mut established))) => {
            established.peer_address = Some(PeerAddress::from(sender_addr));
            established.observed_address = Some(PeerAddress::from(recipient_addr));
            encode_record(&Record::Handshake(HandshakeMessage::Established(
                established,
            )))
            .unwrap()
        }
        _ => payload,
    }
}

type Tamper = Option<fn(Vec<u8>) -> Vec<u8>>;

async fn relay_pair(
    tamper_a_to_b: Tamper,
    tamper_b_to_a: Tamper,
) -> (
    WsChannel<DuplexStream>,
    WsChannel<DuplexStream>,
    JoinHandle<()>,
) {
    let (a_io, relay_a_io) = tokio::io::duplex(1 << 20);
    let (b_io, relay_b_io) = tokio::io::duplex(1 << 20);

    let a_ws = WebSocketStream::from_raw_socket(a_io, WsRole::Client, Some(ws_config())).await;
    let relay_a = WebSocketStream::from_raw_socket(relay_a_io, WsRole::Server, Some(ws_config())).await;
    let b_ws = WebSocketStream::from_raw_socket(b_io, WsRole::Client, Some(ws_config())).await;
    let relay_b = WebSocketStream::from_raw_socket(relay_b_io, WsRole::Server, Some(ws_config())).await;

    let task = tokio::spawn(async move {
        let (mut to_a, mut from_a) = relay_a.split();
        let (mut to_b, mut from_b) = relay_b.split();
        loop {
            tokio::select! {
                msg = from_a.next() => match msg {
                    Some(Ok(Message::Binary(payload))) => {
                        let mut patched = relay_patch(payload, addr_a(), addr_b());
                        if let Some(tamper) = tamper_a_to_b {
                            patched = tamper(patched);
                        }
                        if to_b.send(Message::Binary(patched)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                msg = from_b.next() => match msg {
                    Some(Ok(Message::Binary(payload))) => {
                        let mut patched = relay_patch(payload, addr_b(), addr_a());
                        if let Some(tamper) = tamper_b_to_a {
                            patched = tamper(patched);
                        }
                        if to_a.send(Message::Binary(patched)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
    });

    (
        WsChannel::new(a_ws, TransportKind::Relay, None),
        WsChannel::new(b_ws, TransportKind::Relay, None),
        task,
    )
}

#[tokio::test]
async fn full_handshake_agrees_on_session() {
    let identity_a = Arc::new(HybridSigningKey::generate());
    let identity_b = Arc::new(HybridSigningKey::generate());
    let cfg_a = test_config(identity_a.clone());
    let cfg_b = test_config(identity_b.clone());

    let (mut chan_a, mut chan_b, relay) = relay_pair(None, None).await;

    let (result_a, result_b) = tokio::join!(
        handshake::initiate(&mut chan_a, &cfg_a),
        handshake::respond(&mut chan_b, &cfg_b),
    );
    let session_a = result_a.expect("initiator side");
    let session_b = result_b.expect("responder side");

    // Same session, crossed direction keys.
    assert_eq!(session_a.keys.session_id, session_b.keys.session_id);
    assert_eq!(*session_a.keys.tx_key, *session_b.keys.rx_key);
    assert_eq!(*session_a.keys.rx_key, *session_b.keys.tx_key);
    assert_eq!(session_a.keys.mtu, 1500);
    assert_eq!(session_a.role, Role::Initiator);
    assert_eq!(session_b.role, Role::Responder);

    // Each side learned the other's identity.
    assert_eq!(session_a.peer.peer_id, identity_b.peer_id());
    assert_eq!(session_b.peer.peer_id, identity_a.peer_id());

    // The relay's address fill reached both ends.
    assert_eq!(
        session_a.peer.address.map(|a| a.to_socket_addr()),
        Some(addr_b())
    );
    assert_eq!(
        session_b.peer.address.map(|a| a.to_socket_addr()),
        Some(addr_a())
    );
    assert_eq!(
        session_a.local_observed.map(|a| a.to_socket_addr()),
        Some(addr_a())
    );

    relay.abort();
}

#[tokio::test]
async fn expected_peer_mismatch_is_rejected() {
    let identity_a = Arc::new(HybridSigningKey::generate());
    let identity_b = Arc::new(HybridSigningKey::generate());
    let cfg_a = test_config(identity_a.clone());
    let mut cfg_b = test_config(identity_b.clone());
    // B expects someone else entirely.
    cfg_b.expected_peer = Some([0xEE; 32]);

    let (mut chan_a, mut chan_b, relay) = relay_pair(None, None).await;

    let (result_a, result_b) = tokio::join!(
        handshake::initiate(&mut chan_a, &cfg_a),
        handshake::respond(&mut chan_b, &cfg_b),
    );
    assert!(result_b.is_err());
    assert!(result_a.is_err());
    relay.abort();
}

#[tokio::test]
async fn relay_cannot_rewrite_negotiated_parameters() {
    let identity_a = Arc::new(HybridSigningKey::generate());
    let identity_b = Arc::new(HybridSigningKey::generate());
    let cfg_a = test_config(identity_a.clone());
    let cfg_b = test_config(identity_b.clone());

    // A relay that pins the session to itself by stripping direct
    // support, and quietly shrinks the MTU and rotation interval.
    fn rewrite_established(payload: Vec<u8>) -> Vec<u8> {
        match decode_record(&payload) {
            Ok(Record::Handshake(HandshakeMessage::Established(mut established))) => {
                established.supports_direct_p2p = false;
                established.mtu = 576;
                established.key_rotation_secs = 0;
                encode_record(&Record::Handshake(HandshakeMessage::Established(
                    established,
                )))
                .unwrap()
            }
            _ => payload,
        }
    }

    let (mut chan_a, mut chan_b, relay) = relay_pair(None, Some(rewrite_established)).await;

    let (result_a, result_b) = tokio::join!(
        handshake::initiate(&mut chan_a, &cfg_a),
        handshake::respond(&mut chan_b, &cfg_b),
    );
    // The responder finished before the tampering; only the initiator
    // can see it, and it must refuse the session.
    assert!(matches!(result_a, Err(TunnelError::Auth(_))));
    let _ = result_b;
    relay.abort();
}

#[tokio::test]
async fn tampered_init_signature_gets_no_response() {
    let identity_a = Arc::new(HybridSigningKey::generate());
    let identity_b = Arc::new(HybridSigningKey::generate());
    let cfg_a = test_config(identity_a.clone());
    let cfg_b = test_config(identity_b.clone());

    // The INIT signature trails the record; flip its last byte in flight.
    fn flip_last(mut payload: Vec<u8>) -> Vec<u8> {
        if let Some(last) = payload.last_mut() {
            *last ^= 0x01;
        }
        payload
    }

    let (mut chan_a, mut chan_b, relay) = relay_pair(Some(flip_last), None).await;

    let respond = tokio::spawn({
        async move { handshake::respond(&mut chan_b, &cfg_b).await }
    });
    let initiate = handshake::initiate(&mut chan_a, &cfg_a).await;

    let respond_result = respond.await.unwrap();
    assert!(matches!(
        respond_result,
        Err(TunnelError::Auth(_)) | Err(TunnelError::Crypto(_))
    ));
    // No RESPONSE was ever sent, so the initiator cannot complete.
    assert!(initiate.is_err());
    relay.abort();
}
