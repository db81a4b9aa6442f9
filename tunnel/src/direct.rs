//! Direct-P2P manager
//!
//! Runs the TLS 1.3 WSS listener behind a PQ-countersigned self-signed
//! certificate, dials peers with certificate pinning, drives the
//! migration of a live session onto the direct path, watches its health,
//! and falls back to the relay when it degrades. Holds only the narrow
//! [`TransportSwapHandle`] onto the tunnel manager, never the manager
//! itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crypto::{HybridSignature, HybridSigningKey, HybridVerifyKey};

use crate::config::{RelayConfig, Timeouts};
use crate::error::{Result, TunnelError};
use crate::manager::{ControlEvent, TransportSwapHandle};
use crate::nat::{feasible_with, warm_path, NatCache, NatType};
use crate::rehandshake;
use crate::relay;
use crate::state::ConnState;
use crate::transport::{
    ws_config, ActiveTransport, TransportEvent, TransportInbound, TransportKind, WsChannel,
    KEEPALIVE_INTERVAL,
};
use crate::types::{PinnedCert, RemotePeer, SessionKeys};
use crate::wire::{DirectAdvertisement, FrameKind};

/// Live session keys shared with the listener for inbound re-handshakes;
/// refreshed on every rotation.
pub type SharedKeys = Arc<std::sync::RwLock<Option<SessionKeys>>>;

/// An inbound direct channel that already passed the re-handshake.
pub type DirectServerChannel = WsChannel<tokio_rustls::server::TlsStream<TcpStream>>;

/// Self-signed listener certificate plus its hybrid countersignature.
pub struct ListenerIdentity {
    pub cert_der: Vec<u8>,
    key_der: Zeroizing<Vec<u8>>,
    pub cert_signature: Vec<u8>,
    pub not_before: u64,
    pub not_after: u64,
}

/// Pinned certificates outlive clock drift by months, not years.
const CERT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Domain-separated digest the hybrid identity countersigns.
fn cert_signing_data(der: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/cert");
    hasher.update(der);
    hasher.finalize().to_vec()
}

impl ListenerIdentity {
    /// Mint a fresh self-signed certificate and countersign its DER with
    /// the hybrid identity. CA chains never enter the picture; the DER
    /// plus this signature is the whole trust anchor.
    pub fn generate(identity: &HybridSigningKey) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(vec!["shadowmesh.direct".to_string()]);
        params.alg = &rcgen::PKCS_ED25519;
        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| TunnelError::Transport(format!("certificate generation failed: {e}")))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| TunnelError::Transport(format!("certificate encoding failed: {e}")))?;
        let key_der = Zeroizing::new(cert.serialize_private_key_der());

        let cert_signature = identity.sign(&cert_signing_data(&cert_der)).to_bytes();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            cert_der,
            key_der,
            cert_signature,
            not_before: now,
            not_after: now + CERT_VALIDITY.as_secs(),
        })
    }

    /// The advertisement carried in the handshake.
    pub fn advertisement(&self, listen_port: u16, nat_type: Option<NatType>) -> DirectAdvertisement {
        DirectAdvertisement {
            listen_port,
            cert_der: self.cert_der.clone(),
            cert_signature: self.cert_signature.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            nat_type,
        }
    }
}

/// Verify a peer's pinned certificate: the PQ countersignature against
/// the peer's known hybrid key, and the X.509 validity window.
pub fn verify_pinned_cert(cert: &PinnedCert, peer_key: &HybridVerifyKey) -> Result<()> {
    let signature = HybridSignature::from_bytes(&cert.pq_signature)
        .map_err(|_| TunnelError::Pin("malformed countersignature"))?;
    peer_key
        .verify(&cert_signing_data(&cert.der), &signature)
        .map_err(|_| TunnelError::Pin("countersignature does not verify"))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(&cert.der)
        .map_err(|_| TunnelError::Pin("unparseable certificate der"))?;
    if !parsed.validity().is_valid() {
        return Err(TunnelError::Pin("certificate outside validity window"));
    }
    Ok(())
}

/// The direct WSS listener on a random high port.
pub struct DirectListener {
    port: u16,
    task: JoinHandle<()>,
}

impl DirectListener {
    /// Bind on an OS-assigned port and start accepting. Inbound
    /// connections run TLS, the WebSocket upgrade and the re-handshake
    /// before being surfaced on `accepted_tx`; anything that fails any
    /// step is dropped without a response.
    pub async fn bind(
        identity: &ListenerIdentity,
        shared_keys: SharedKeys,
        accepted_tx: mpsc::Sender<DirectServerChannel>,
        rehandshake_deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cert = rustls::pki_types::CertificateDer::from(identity.cert_der.clone());
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(identity.key_der.to_vec()),
        );
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| TunnelError::Transport(format!("listener tls config rejected: {e}")))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let tcp = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| TunnelError::Transport(format!("direct listener bind failed: {e}")))?;
        let port = tcp
            .local_addr()
            .map_err(|e| TunnelError::Transport(e.to_string()))?
            .port();
        info!(port, "direct listener bound");

        let task = tokio::spawn(accept_loop(
            tcp,
            acceptor,
            shared_keys,
            accepted_tx,
            rehandshake_deadline,
            cancel,
        ));

        Ok(Self { port, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    shared_keys: SharedKeys,
    accepted_tx: mpsc::Sender<DirectServerChannel>,
    rehandshake_deadline: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "direct accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, "inbound direct connection");

        let acceptor = acceptor.clone();
        let shared_keys = shared_keys.clone();
        let accepted_tx = accepted_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let tls = timeout(rehandshake_deadline, acceptor.accept(stream))
                    .await
                    .map_err(|_| TunnelError::Timeout("direct tls accept"))?
                    .map_err(|e| TunnelError::Transport(e.to_string()))?;
                let ws = timeout(
                    rehandshake_deadline,
                    tokio_tungstenite::accept_async_with_config(tls, Some(ws_config())),
                )
                .await
                .map_err(|_| TunnelError::Timeout("direct ws accept"))?
                .map_err(|e| TunnelError::Transport(e.to_string()))?;

                let mut channel = WsChannel::new(ws, TransportKind::Direct, Some(peer));
                let keys = shared_keys
                    .read()
                    .expect("shared keys lock poisoned")
                    .clone()
                    .ok_or(TunnelError::SessionClosed)?;
                rehandshake::run_responder(&mut channel, &keys, rehandshake_deadline).await?;
                Ok::<_, TunnelError>(channel)
            }
            .await;

            match result {
                Ok(channel) => {
                    let _ = accepted_tx.send(channel).await;
                }
                Err(e) => {
                    // No response on failure; an unauthenticated caller
                    // learns nothing.
                    debug!(%peer, error = %e, "inbound direct rejected");
                }
            }
        });
    }
}

/// Parameters for the supervisor task.
pub struct DirectParams {
    pub swap: TransportSwapHandle,
    pub peer: RemotePeer,
    /// Whether this endpoint dials (the session initiator dials; the
    /// responder listens)
    pub dialer: bool,
    pub shared_keys: SharedKeys,
    pub relay_cfg: RelayConfig,
    pub nat: Arc<NatCache>,
    pub punch_delay: Duration,
    pub net_inbound_tx: mpsc::Sender<TransportInbound>,
    pub transport_events_tx: mpsc::Sender<TransportEvent>,
    pub accepted_rx: mpsc::Receiver<DirectServerChannel>,
    pub timeouts: Timeouts,
    pub cancel: CancellationToken,
}

/// Spawn the direct-P2P supervisor.
pub fn spawn(params: DirectParams) -> JoinHandle<()> {
    tokio::spawn(run(params))
}

async fn run(mut params: DirectParams) {
    let mut control_rx = params.swap.subscribe();
    let mut health = interval_at(
        Instant::now() + params.timeouts.health_interval,
        params.timeouts.health_interval,
    );
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // First dial attempt shortly after establishment.
    let mut retry_at: Option<Instant> = params
        .dialer
        .then(|| Instant::now() + Duration::from_millis(50));
    // Relay transport kept open until the peer confirms the direct path.
    let mut pending_old: Option<ActiveTransport> = None;
    let mut awaiting_pong = false;
    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            _ = params.cancel.cancelled() => break,

            accepted = params.accepted_rx.recv() => {
                let Some(channel) = accepted else { continue };
                match install_accepted(&params, channel).await {
                    Ok(old_relay) => pending_old = Some(old_relay),
                    Err(e) => warn!(error = %e, "inbound migration failed"),
                }
            }

            event = control_rx.recv() => match event {
                Ok(ControlEvent::DirectActive) => {
                    if let Some(old) = pending_old.take() {
                        old.close().await;
                        info!("relay transport closed after direct activation");
                    }
                }
                Ok(ControlEvent::PongReceived) => {
                    awaiting_pong = false;
                    missed_pongs = 0;
                }
                Ok(ControlEvent::TransportDead(TransportKind::Direct)) => {
                    if params.swap.current_state() == ConnState::DirectEstablished {
                        fall_back(&params).await;
                        retry_at = Some(Instant::now() + params.timeouts.direct_retry);
                        awaiting_pong = false;
                        missed_pongs = 0;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            _ = health.tick() => {
                if params.swap.current_state() != ConnState::DirectEstablished {
                    awaiting_pong = false;
                    missed_pongs = 0;
                    continue;
                }
                if awaiting_pong {
                    missed_pongs += 1;
                }
                if missed_pongs >= 2 {
                    warn!("direct path failed two health probes");
                    fall_back(&params).await;
                    retry_at = Some(Instant::now() + params.timeouts.direct_retry);
                    awaiting_pong = false;
                    missed_pongs = 0;
                    continue;
                }
                if params
                    .swap
                    .send_control(FrameKind::Ping, Vec::new())
                    .await
                    .is_ok()
                {
                    awaiting_pong = true;
                }
            }

            _ = maybe_sleep(retry_at), if retry_at.is_some() => {
                retry_at = None;
                if !params.dialer || params.swap.current_state() != ConnState::RelayEstablished {
                    continue;
                }
                match attempt_direct(&params).await {
                    Ok(()) => {}
                    Err(TunnelError::NatInfeasible(reason)) => {
                        // Infeasible is not a failure; stay on relay until
                        // a degradation re-probes.
                        info!(reason, "direct path infeasible, staying on relay");
                    }
                    Err(e) => {
                        warn!(error = %e, "direct migration attempt failed");
                        params.swap.stats().record_migration(false);
                        retry_at = Some(Instant::now() + params.timeouts.direct_retry);
                    }
                }
            }
        }
    }
}

async fn maybe_sleep(at: Option<Instant>) {
    match at {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Responder side: a re-handshaken inbound channel replaces the relay.
async fn install_accepted(
    params: &DirectParams,
    channel: DirectServerChannel,
) -> Result<ActiveTransport> {
    let machine = params.swap.state_machine();
    machine.transition(ConnState::Migrating)?;

    let active = channel.into_active(
        params.net_inbound_tx.clone(),
        params.transport_events_tx.clone(),
        KEEPALIVE_INTERVAL,
    );
    match params.swap.swap_transport(active).await {
        Ok(old_relay) => {
            machine.transition(ConnState::DirectEstablished)?;
            params.swap.stats().record_migration(true);
            info!("migrated to inbound direct transport");
            Ok(old_relay)
        }
        Err(e) => {
            let _ = machine.transition(ConnState::RelayEstablished);
            Err(e)
        }
    }
}

/// Dialer side: feasibility check, rendezvous warmup, pinned TLS dial,
/// re-handshake, swap, relay close. Bounded end to end by the caller's
/// budgets.
async fn attempt_direct(params: &DirectParams) -> Result<()> {
    let peer = &params.peer;
    if !peer.supports_direct {
        return Err(TunnelError::NatInfeasible("peer does not accept direct"));
    }
    let Some(address) = peer.address else {
        return Err(TunnelError::NatInfeasible("no published peer address"));
    };
    let Some(port) = peer.direct_port else {
        return Err(TunnelError::NatInfeasible("no advertised listener port"));
    };
    let Some(pinned) = peer.pinned_cert.as_ref() else {
        return Err(TunnelError::Pin("peer advertised no certificate"));
    };

    let probe = params.nat.probe().await?;
    let peer_nat = peer.nat_type.unwrap_or(NatType::FullCone);
    if !feasible_with(probe.nat_type, peer_nat) {
        return Err(TunnelError::NatInfeasible("symmetric nat in the path"));
    }

    // The pin is validated before any connection is opened.
    verify_pinned_cert(pinned, &peer.verify_key)?;

    let mut target = address.to_socket_addr();
    target.set_port(port);

    let machine = params.swap.state_machine();
    machine.transition(ConnState::Migrating)?;

    match dial_and_migrate(params, target, pinned).await {
        Ok(old_relay) => {
            // Final notice over the relay, then a graceful close.
            match params
                .swap
                .seal_control(FrameKind::DirectActive, Vec::new())
                .await
            {
                Ok(record) => {
                    let _ = old_relay.send(record).await;
                    old_relay
                        .flush_outbound(params.timeouts.migration_flush)
                        .await;
                }
                Err(e) => warn!(error = %e, "failed to seal direct-active notice"),
            }
            old_relay.close().await;

            machine.transition(ConnState::DirectEstablished)?;
            params.swap.stats().record_migration(true);
            info!(%target, "migrated to direct transport");
            Ok(())
        }
        Err(e) => {
            let _ = machine.transition(ConnState::RelayEstablished);
            Err(e)
        }
    }
}

async fn dial_and_migrate(
    params: &DirectParams,
    target: SocketAddr,
    pinned: &PinnedCert,
) -> Result<ActiveTransport> {
    warm_path(target, params.punch_delay).await;

    let tcp = timeout(params.timeouts.direct_dial, TcpStream::connect(target))
        .await
        .map_err(|_| TunnelError::Timeout("direct dial"))?
        .map_err(|e| TunnelError::Transport(format!("direct dial failed: {e}")))?;
    let _ = tcp.set_nodelay(true);

    let tls_config = pinned_client_config(pinned);
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::from(target.ip());
    let tls = timeout(params.timeouts.direct_dial, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TunnelError::Timeout("direct tls"))?
        .map_err(|e| {
            debug!(error = %e, "direct tls handshake failed");
            TunnelError::Pin("presented certificate does not match the pin")
        })?;

    let url = format!("wss://{target}/");
    let (ws, _) = timeout(
        params.timeouts.rehandshake,
        tokio_tungstenite::client_async_with_config(url, tls, Some(ws_config())),
    )
    .await
    .map_err(|_| TunnelError::Timeout("direct ws upgrade"))?
    .map_err(|e| TunnelError::Transport(e.to_string()))?;

    let mut channel = WsChannel::new(ws, TransportKind::Direct, Some(target));
    let keys = params
        .shared_keys
        .read()
        .expect("shared keys lock poisoned")
        .clone()
        .ok_or(TunnelError::SessionClosed)?;
    rehandshake::run_initiator(&mut channel, &keys, params.timeouts.rehandshake).await?;

    let active = channel.into_active(
        params.net_inbound_tx.clone(),
        params.transport_events_tx.clone(),
        KEEPALIVE_INTERVAL,
    );
    params.swap.swap_transport(active).await
}

/// Degraded: reopen the relay, swap back, retain session and counters.
async fn fall_back(params: &DirectParams) {
    let machine = params.swap.state_machine();
    if machine.transition(ConnState::Degraded).is_err() {
        return;
    }
    params.nat.invalidate();
    params.swap.stats().record_fallback();

    match relay::connect(&params.relay_cfg, params.timeouts.handshake).await {
        Ok(channel) => {
            let active = channel.into_active(
                params.net_inbound_tx.clone(),
                params.transport_events_tx.clone(),
                KEEPALIVE_INTERVAL,
            );
            match params.swap.swap_transport(active).await {
                Ok(dead_direct) => {
                    dead_direct.close().await;
                    let _ = machine.transition(ConnState::RelayEstablished);
                    info!("fell back to relay transport");
                }
                Err(e) => {
                    warn!(error = %e, "fallback swap failed");
                    let _ = machine.transition(ConnState::Closed);
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "relay reconnect failed during fallback");
            let _ = machine.transition(ConnState::Closed);
        }
    }
}

/// TLS client configuration accepting exactly the pinned certificate.
pub fn pinned_client_config(pinned: &PinnedCert) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
            pinned_der: pinned.der.clone(),
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }))
        .with_no_client_auth()
}

/// Accepts one exact DER and nothing else. The PQ countersignature was
/// verified against the pinned bytes before dialing, so byte equality
/// here carries that trust onto the wire certificate.
#[derive(Debug)]
struct PinnedVerifier {
    pinned_der: Vec<u8>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() != self.pinned_der.as_slice() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
