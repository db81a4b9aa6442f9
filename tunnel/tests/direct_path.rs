//! Direct-path establishment over real TLS on loopback: pinned dial,
//! re-handshake binding, and pin-mismatch rejection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crypto::HybridSigningKey;
use shadowmesh_tunnel::direct::{
    pinned_client_config, verify_pinned_cert, DirectListener, ListenerIdentity, SharedKeys,
};
use shadowmesh_tunnel::rehandshake;
use shadowmesh_tunnel::transport::{ws_config, TransportKind, WsChannel};
use shadowmesh_tunnel::types::{Negotiated, PinnedCert, Role, SessionKeys};

fn session_pair() -> (SessionKeys, SessionKeys) {
    let negotiated = Negotiated {
        mtu: 1500,
        heartbeat_interval: Duration::from_secs(30),
        key_rotation_interval: Duration::from_secs(3600),
    };
    let sid = [3u8; 16];
    let ikm = [0x66u8; 64];
    (
        SessionKeys::derive(sid, &ikm, Role::Initiator, negotiated),
        SessionKeys::derive(sid, &ikm, Role::Responder, negotiated),
    )
}

fn pinned_from(identity: &HybridSigningKey, listener: &ListenerIdentity) -> PinnedCert {
    PinnedCert {
        der: listener.cert_der.clone(),
        pq_signature: listener.cert_signature.clone(),
        not_before: listener.not_before,
        not_after: listener.not_after,
        peer_id: identity.peer_id(),
    }
}

async fn dial_tls(
    port: u16,
    pinned: &PinnedCert,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await?;
    let connector = TlsConnector::from(Arc::new(pinned_client_config(pinned)));
    let name = rustls::pki_types::ServerName::from(std::net::IpAddr::from([127, 0, 0, 1]));
    connector.connect(name, tcp).await
}

#[tokio::test]
async fn pinned_dial_and_rehandshake_succeed() {
    let identity = HybridSigningKey::generate();
    let listener_identity = ListenerIdentity::generate(&identity).unwrap();
    let pinned = pinned_from(&identity, &listener_identity);
    verify_pinned_cert(&pinned, &identity.public()).unwrap();

    let (dialer_keys, listener_keys) = session_pair();
    let shared: SharedKeys = Arc::new(std::sync::RwLock::new(Some(listener_keys)));
    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let listener = DirectListener::bind(
        &listener_identity,
        shared,
        accepted_tx,
        Duration::from_secs(5),
        cancel.clone(),
    )
    .await
    .unwrap();

    // Dial with the correct pin and bind the session to the channel.
    let tls = dial_tls(listener.port(), &pinned).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async_with_config(
        format!("wss://127.0.0.1:{}/", listener.port()),
        tls,
        Some(ws_config()),
    )
    .await
    .unwrap();
    let mut channel = WsChannel::new(ws, TransportKind::Direct, None);
    rehandshake::run_initiator(&mut channel, &dialer_keys, Duration::from_secs(5))
        .await
        .unwrap();

    // The listener surfaced the authenticated channel.
    let authenticated = tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
        .await
        .expect("accepted within deadline");
    assert!(authenticated.is_some());

    cancel.cancel();
    listener.shutdown().await;
}

#[tokio::test]
async fn mismatched_pin_aborts_the_dial() {
    let identity = HybridSigningKey::generate();
    let listener_identity = ListenerIdentity::generate(&identity).unwrap();

    let (_, listener_keys) = session_pair();
    let shared: SharedKeys = Arc::new(std::sync::RwLock::new(Some(listener_keys)));
    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let listener = DirectListener::bind(
        &listener_identity,
        shared,
        accepted_tx,
        Duration::from_secs(2),
        cancel.clone(),
    )
    .await
    .unwrap();

    // Pin a certificate from a different identity entirely.
    let other_identity = HybridSigningKey::generate();
    let other_listener = ListenerIdentity::generate(&other_identity).unwrap();
    let wrong_pin = pinned_from(&other_identity, &other_listener);

    let result = dial_tls(listener.port(), &wrong_pin).await;
    assert!(result.is_err(), "dial must abort on pin mismatch");

    // Nothing authenticated came through.
    assert!(accepted_rx.try_recv().is_err());

    cancel.cancel();
    listener.shutdown().await;
}

#[tokio::test]
async fn wrong_session_keys_fail_the_rehandshake() {
    let identity = HybridSigningKey::generate();
    let listener_identity = ListenerIdentity::generate(&identity).unwrap();
    let pinned = pinned_from(&identity, &listener_identity);

    let (_, listener_keys) = session_pair();
    let shared: SharedKeys = Arc::new(std::sync::RwLock::new(Some(listener_keys)));
    let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let listener = DirectListener::bind(
        &listener_identity,
        shared,
        accepted_tx,
        Duration::from_secs(2),
        cancel.clone(),
    )
    .await
    .unwrap();

    // A dialer holding keys from some other session.
    let negotiated = Negotiated {
        mtu: 1500,
        heartbeat_interval: Duration::from_secs(30),
        key_rotation_interval: Duration::from_secs(3600),
    };
    let foreign = SessionKeys::derive([9u8; 16], &[0x11u8; 64], Role::Initiator, negotiated);

    let tls = dial_tls(listener.port(), &pinned).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async_with_config(
        format!("wss://127.0.0.1:{}/", listener.port()),
        tls,
        Some(ws_config()),
    )
    .await
    .unwrap();
    let mut channel = WsChannel::new(ws, TransportKind::Direct, None);
    let result = rehandshake::run_initiator(&mut channel, &foreign, Duration::from_secs(2)).await;
    assert!(result.is_err(), "foreign session keys must not bind");

    // The listener dropped the connection without surfacing it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(accepted_rx.try_recv().is_err());

    cancel.cancel();
    listener.shutdown().await;
}
