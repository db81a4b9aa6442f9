//! Handshake orchestrator
//!
//! Four messages over the relay establish a session between two clients:
//! INIT and RESPONSE carry the hybrid key exchange under both peers'
//! hybrid signatures, CONFIRM binds the derived secret, and ESTABLISHED
//! carries the negotiated parameters plus the relay-observed addresses.
//! Nonces are cross-bound into the signatures so the relay's ordering is
//! never trusted; timestamps bound clock skew.
//!
//! The in-band re-keying round ([`RekeyDriver`]) runs the same hybrid
//! KEM exchange under the live session, authenticated by both identities.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crypto::{
    HybridKemKeys, HybridKemPublic, HybridKemResponse, HybridSignature, HybridSigningKey,
    HybridVerifyKey, PeerId,
};

use crate::error::{HandshakeError, Result, TunnelError};
use crate::transport::WsChannel;
use crate::types::{Negotiated, PeerAddress, PinnedCert, RemotePeer, Role, SessionId, SessionKeys};
use crate::wire::{
    encode_body, ConfirmMessage, DirectAdvertisement, EstablishedMessage, HandshakeMessage,
    InitMessage, Record, RekeyAckMessage, RekeyInitMessage, ResponseMessage,
};

/// Maximum tolerated clock skew on CONFIRM/ESTABLISHED timestamps.
pub const HANDSHAKE_SKEW: Duration = Duration::from_secs(60);

/// Inputs the orchestrator needs on either side of the exchange.
#[derive(Clone)]
pub struct HandshakeConfig {
    pub identity: Arc<HybridSigningKey>,
    pub client_id: PeerId,
    /// This endpoint's preferred session parameters; the responder's win.
    pub negotiated: Negotiated,
    pub timeout: Duration,
    /// Local direct-listener advertisement, if one is running
    pub direct: Option<DirectAdvertisement>,
    /// Refuse any peer other than this one, when set
    pub expected_peer: Option<PeerId>,
    /// Rendezvous timing hint offered to the initiator (responder side)
    pub punch_delay: Duration,
}

/// Outcome of a completed handshake.
pub struct SessionEstablished {
    pub keys: SessionKeys,
    pub peer: RemotePeer,
    pub role: Role,
    /// This endpoint's own public address, as the relay observed it
    pub local_observed: Option<PeerAddress>,
    /// Simultaneous-open timing hint from the ESTABLISHED exchange
    pub punch_delay: Duration,
}

/// Run the initiator side over an open relay channel.
pub async fn initiate<S>(
    channel: &mut WsChannel<S>,
    cfg: &HandshakeConfig,
) -> Result<SessionEstablished>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(cfg.timeout, do_initiate(channel, cfg))
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))?
}

/// Run the responder side over an open relay channel.
pub async fn respond<S>(
    channel: &mut WsChannel<S>,
    cfg: &HandshakeConfig,
) -> Result<SessionEstablished>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(cfg.timeout, do_respond(channel, cfg))
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))?
}

async fn do_initiate<S>(
    channel: &mut WsChannel<S>,
    cfg: &HandshakeConfig,
) -> Result<SessionEstablished>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut rng = rand::rngs::OsRng;
    let kem = HybridKemKeys::generate();
    let kem_public = kem.public();
    let mut nonce_a = [0u8; 16];
    rng.fill_bytes(&mut nonce_a);

    let mut init = InitMessage {
        client_id: cfg.client_id,
        verify_key: cfg.identity.public().to_bytes(),
        mlkem_public: kem_public.mlkem.clone(),
        x25519_public: kem_public.x25519,
        nonce: nonce_a,
        signature: Vec::new(),
    };
    init.signature = cfg.identity.sign(&init_signing_data(&init)).to_bytes();
    channel
        .send_record(&Record::Handshake(HandshakeMessage::Init(init)))
        .await?;
    debug!("sent INIT");

    // RESPONSE
    let response = match recv_handshake(channel).await? {
        HandshakeMessage::Response(msg) => msg,
        other => return Err(unexpected("RESPONSE", &other)),
    };
    let peer_key = verify_key_for(&response.verify_key, response.client_id, cfg)?;
    peer_key
        .verify(
            &response_signing_data(&response, &nonce_a),
            &parse_signature(&response.signature)?,
        )
        .map_err(|_| auth_failure("RESPONSE.signature"))?;
    debug!("verified RESPONSE");

    let secrets = kem.decapsulate(&HybridKemResponse {
        mlkem_ciphertext: response.mlkem_ciphertext.clone(),
        x25519: response.x25519_public,
    })?;
    let ikm = secrets.ikm();
    let ss_hash = shared_secret_hash(ikm.as_ref());

    // CONFIRM
    let session_id = response.session_id;
    let mut confirm = ConfirmMessage {
        session_id,
        timestamp: unix_now(),
        direct: cfg.direct.clone(),
        peer_address: None,
        observed_address: None,
        signature: Vec::new(),
    };
    confirm.signature = cfg
        .identity
        .sign(&confirm_signing_data(&confirm, &response.nonce, &ss_hash)?)
        .to_bytes();
    channel
        .send_record(&Record::Handshake(HandshakeMessage::Confirm(confirm)))
        .await?;
    debug!("sent CONFIRM");

    // ESTABLISHED
    let established = match recv_handshake(channel).await? {
        HandshakeMessage::Established(msg) => msg,
        other => return Err(unexpected("ESTABLISHED", &other)),
    };
    if established.session_id != session_id {
        return Err(TunnelError::SessionMismatch);
    }
    check_skew(established.timestamp)?;
    // The negotiated parameters come through the untrusted relay; accept
    // nothing the responder did not sign.
    peer_key
        .verify(
            &established_signing_data(&established, &nonce_a)?,
            &parse_signature(&established.signature)?,
        )
        .map_err(|_| auth_failure("ESTABLISHED.signature"))?;
    debug!("verified ESTABLISHED");

    let negotiated = Negotiated {
        mtu: established.mtu,
        heartbeat_interval: Duration::from_secs(established.heartbeat_secs as u64),
        key_rotation_interval: Duration::from_secs(established.key_rotation_secs as u64),
    };
    let keys = SessionKeys::derive(session_id, ikm.as_ref(), Role::Initiator, negotiated);

    let peer = remote_peer_from(
        peer_key,
        established.peer_address,
        established.supports_direct_p2p,
        established.direct.as_ref(),
    );
    info!(
        peer_id = %hex::encode(peer.peer_id),
        session_id = %hex::encode(session_id),
        "session established as initiator"
    );

    Ok(SessionEstablished {
        keys,
        peer,
        role: Role::Initiator,
        local_observed: established.observed_address,
        punch_delay: Duration::from_millis(established.punch_delay_ms as u64),
    })
}

async fn do_respond<S>(
    channel: &mut WsChannel<S>,
    cfg: &HandshakeConfig,
) -> Result<SessionEstablished>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut rng = rand::rngs::OsRng;

    // INIT
    let init = match recv_handshake(channel).await? {
        HandshakeMessage::Init(msg) => msg,
        other => return Err(unexpected("INIT", &other)),
    };
    let peer_key = verify_key_for(&init.verify_key, init.client_id, cfg)?;
    peer_key
        .verify(
            &init_signing_data(&init),
            &parse_signature(&init.signature)?,
        )
        .map_err(|_| auth_failure("INIT.signature"))?;
    debug!("verified INIT");

    let (kem_response, secrets) = HybridKemKeys::encapsulate_to(&HybridKemPublic {
        mlkem: init.mlkem_public.clone(),
        x25519: init.x25519_public,
    })?;
    let ikm = secrets.ikm();
    let expected_ss_hash = shared_secret_hash(ikm.as_ref());

    let mut session_id = [0u8; 16];
    rng.fill_bytes(&mut session_id);
    let mut nonce_b = [0u8; 16];
    rng.fill_bytes(&mut nonce_b);

    // RESPONSE
    let mut response = ResponseMessage {
        client_id: cfg.client_id,
        verify_key: cfg.identity.public().to_bytes(),
        mlkem_ciphertext: kem_response.mlkem_ciphertext,
        x25519_public: kem_response.x25519,
        nonce: nonce_b,
        session_id,
        signature: Vec::new(),
    };
    response.signature = cfg
        .identity
        .sign(&response_signing_data(&response, &init.nonce))
        .to_bytes();
    channel
        .send_record(&Record::Handshake(HandshakeMessage::Response(response)))
        .await?;
    debug!("sent RESPONSE");

    // CONFIRM
    let confirm = match recv_handshake(channel).await? {
        HandshakeMessage::Confirm(msg) => msg,
        other => return Err(unexpected("CONFIRM", &other)),
    };
    if confirm.session_id != session_id {
        return Err(TunnelError::SessionMismatch);
    }
    check_skew(confirm.timestamp)?;
    peer_key
        .verify(
            &confirm_signing_data(&confirm, &nonce_b, &expected_ss_hash)?,
            &parse_signature(&confirm.signature)?,
        )
        .map_err(|_| auth_failure("CONFIRM.signature"))?;
    debug!("verified CONFIRM");

    // ESTABLISHED
    let mut established = EstablishedMessage {
        session_id,
        timestamp: unix_now(),
        mtu: cfg.negotiated.mtu,
        heartbeat_secs: cfg.negotiated.heartbeat_interval.as_secs() as u32,
        key_rotation_secs: cfg.negotiated.key_rotation_interval.as_secs() as u32,
        supports_direct_p2p: cfg.direct.is_some(),
        direct: cfg.direct.clone(),
        peer_address: None,
        observed_address: None,
        punch_delay_ms: cfg.punch_delay.as_millis() as u32,
        signature: Vec::new(),
    };
    established.signature = cfg
        .identity
        .sign(&established_signing_data(&established, &init.nonce)?)
        .to_bytes();
    channel
        .send_record(&Record::Handshake(HandshakeMessage::Established(
            established,
        )))
        .await?;

    let keys = SessionKeys::derive(session_id, ikm.as_ref(), Role::Responder, cfg.negotiated);
    let peer = remote_peer_from(
        peer_key,
        confirm.peer_address,
        confirm.direct.is_some(),
        confirm.direct.as_ref(),
    );
    info!(
        peer_id = %hex::encode(peer.peer_id),
        session_id = %hex::encode(session_id),
        "session established as responder"
    );

    Ok(SessionEstablished {
        keys,
        peer,
        role: Role::Responder,
        local_observed: confirm.observed_address,
        punch_delay: cfg.punch_delay,
    })
}

async fn recv_handshake<S>(channel: &mut WsChannel<S>) -> Result<HandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match channel.recv_record().await? {
        Record::Handshake(msg) => Ok(msg),
        Record::Rehandshake(_) => Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
            expected: "handshake record",
            got: "rehandshake record",
        })),
        Record::Frame(_) => Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
            expected: "handshake record",
            got: "encrypted frame",
        })),
    }
}

fn unexpected(expected: &'static str, got: &HandshakeMessage) -> TunnelError {
    TunnelError::Handshake(HandshakeError::UnexpectedMessage {
        expected,
        got: got.message_type(),
    })
}

fn auth_failure(field: &'static str) -> TunnelError {
    // Log the field, never its contents.
    warn!(field, "handshake signature verification failed");
    TunnelError::Auth("hybrid signature verification failed")
}

fn parse_signature(bytes: &[u8]) -> Result<HybridSignature> {
    HybridSignature::from_bytes(bytes)
        .map_err(|_| TunnelError::Auth("malformed hybrid signature"))
}

/// Parse the peer's verify key and bind it to the claimed client id.
fn verify_key_for(
    key_bytes: &[u8],
    claimed_id: PeerId,
    cfg: &HandshakeConfig,
) -> Result<HybridVerifyKey> {
    let key = HybridVerifyKey::from_bytes(key_bytes)?;
    if key.peer_id() != claimed_id {
        return Err(TunnelError::Handshake(HandshakeError::ClientIdMismatch));
    }
    if let Some(expected) = cfg.expected_peer {
        if claimed_id != expected {
            return Err(TunnelError::Handshake(HandshakeError::UnexpectedPeer));
        }
    }
    Ok(key)
}

fn remote_peer_from(
    verify_key: HybridVerifyKey,
    address: Option<PeerAddress>,
    supports_direct: bool,
    advert: Option<&DirectAdvertisement>,
) -> RemotePeer {
    let peer_id = verify_key.peer_id();
    RemotePeer {
        peer_id,
        verify_key,
        address,
        supports_direct: supports_direct && advert.is_some(),
        direct_port: advert.map(|a| a.listen_port),
        pinned_cert: advert.map(|a| PinnedCert {
            der: a.cert_der.clone(),
            pq_signature: a.cert_signature.clone(),
            not_before: a.not_before,
            not_after: a.not_after,
            peer_id,
        }),
        nat_type: advert.and_then(|a| a.nat_type),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_skew(timestamp: u64) -> Result<()> {
    let now = unix_now();
    let skew = now.abs_diff(timestamp);
    if skew > HANDSHAKE_SKEW.as_secs() {
        return Err(TunnelError::Handshake(HandshakeError::ClockSkew));
    }
    Ok(())
}

fn shared_secret_hash(ikm: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/hs/ss");
    hasher.update(ikm);
    hasher.finalize().into()
}

fn init_signing_data(msg: &InitMessage) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/hs/init");
    hasher.update(msg.client_id);
    hasher.update(&msg.verify_key);
    hasher.update(&msg.mlkem_public);
    hasher.update(msg.x25519_public);
    hasher.update(msg.nonce);
    hasher.finalize().to_vec()
}

fn response_signing_data(msg: &ResponseMessage, nonce_a: &[u8; 16]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/hs/resp");
    hasher.update(msg.client_id);
    hasher.update(&msg.verify_key);
    hasher.update(&msg.mlkem_ciphertext);
    hasher.update(msg.x25519_public);
    hasher.update(msg.nonce);
    hasher.update(msg.session_id);
    hasher.update(nonce_a);
    hasher.finalize().to_vec()
}

// The relay-filled address fields are deliberately outside the digest.
fn confirm_signing_data(
    msg: &ConfirmMessage,
    nonce_b: &[u8; 16],
    ss_hash: &[u8; 32],
) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/hs/confirm");
    hasher.update(msg.session_id);
    hasher.update(nonce_b);
    hasher.update(ss_hash);
    hasher.update(msg.timestamp.to_be_bytes());
    hasher.update(encode_body(&msg.direct)?);
    Ok(hasher.finalize().to_vec())
}

// Covers every negotiated parameter; only the relay-filled address
// fields stay outside the digest. Bound to the initiator's nonce.
fn established_signing_data(msg: &EstablishedMessage, nonce_a: &[u8; 16]) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/hs/established");
    hasher.update(msg.session_id);
    hasher.update(nonce_a);
    hasher.update(msg.timestamp.to_be_bytes());
    hasher.update(msg.mtu.to_be_bytes());
    hasher.update(msg.heartbeat_secs.to_be_bytes());
    hasher.update(msg.key_rotation_secs.to_be_bytes());
    hasher.update([msg.supports_direct_p2p as u8]);
    hasher.update(encode_body(&msg.direct)?);
    hasher.update(msg.punch_delay_ms.to_be_bytes());
    Ok(hasher.finalize().to_vec())
}

/// In-band key rotation rounds for a live session.
///
/// The session initiator drives rotations on its interval; both sides can
/// answer. Message bodies ride encrypted inside control frames, so the
/// signatures here defend against a compromised-relay replay, not a
/// passive observer.
pub struct RekeyDriver {
    identity: Arc<HybridSigningKey>,
    peer_key: HybridVerifyKey,
    session_id: SessionId,
    role: Role,
    negotiated: Negotiated,
    epoch: u32,
    pending: Option<HybridKemKeys>,
}

impl RekeyDriver {
    pub fn new(
        identity: Arc<HybridSigningKey>,
        peer_key: HybridVerifyKey,
        session_id: SessionId,
        role: Role,
        negotiated: Negotiated,
    ) -> Self {
        Self {
            identity,
            peer_key,
            session_id,
            role,
            negotiated,
            epoch: 0,
            pending: None,
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Open a rotation round with a fresh ephemeral key pair.
    pub fn initiate(&mut self) -> Result<RekeyInitMessage> {
        let kem = HybridKemKeys::generate();
        let public = kem.public();
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut msg = RekeyInitMessage {
            epoch: self.epoch + 1,
            mlkem_public: public.mlkem,
            x25519_public: public.x25519,
            nonce,
            signature: Vec::new(),
        };
        msg.signature = self
            .identity
            .sign(&rekey_init_signing_data(&self.session_id, &msg))
            .to_bytes();
        self.pending = Some(kem);
        Ok(msg)
    }

    /// Answer a rotation round; returns the ack and the new epoch's keys.
    pub fn handle_init(&mut self, msg: &RekeyInitMessage) -> Result<(RekeyAckMessage, SessionKeys)> {
        if msg.epoch != self.epoch + 1 {
            return Err(TunnelError::SessionMismatch);
        }
        self.peer_key
            .verify(
                &rekey_init_signing_data(&self.session_id, msg),
                &parse_signature(&msg.signature)?,
            )
            .map_err(|_| auth_failure("REKEY_INIT.signature"))?;

        let (kem_response, secrets) = HybridKemKeys::encapsulate_to(&HybridKemPublic {
            mlkem: msg.mlkem_public.clone(),
            x25519: msg.x25519_public,
        })?;
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut ack = RekeyAckMessage {
            epoch: msg.epoch,
            mlkem_ciphertext: kem_response.mlkem_ciphertext,
            x25519_public: kem_response.x25519,
            nonce,
            signature: Vec::new(),
        };
        ack.signature = self
            .identity
            .sign(&rekey_ack_signing_data(&self.session_id, &ack))
            .to_bytes();

        self.epoch = msg.epoch;
        let keys = SessionKeys::derive(
            self.session_id,
            secrets.ikm().as_ref(),
            self.role,
            self.negotiated,
        );
        Ok((ack, keys))
    }

    /// Close the round this side opened; returns the new epoch's keys.
    pub fn handle_ack(&mut self, msg: &RekeyAckMessage) -> Result<SessionKeys> {
        if msg.epoch != self.epoch + 1 {
            return Err(TunnelError::SessionMismatch);
        }
        self.peer_key
            .verify(
                &rekey_ack_signing_data(&self.session_id, msg),
                &parse_signature(&msg.signature)?,
            )
            .map_err(|_| auth_failure("REKEY_ACK.signature"))?;

        let kem = self
            .pending
            .take()
            .ok_or(TunnelError::Handshake(HandshakeError::InvalidState))?;
        let secrets = kem.decapsulate(&HybridKemResponse {
            mlkem_ciphertext: msg.mlkem_ciphertext.clone(),
            x25519: msg.x25519_public,
        })?;

        self.epoch = msg.epoch;
        Ok(SessionKeys::derive(
            self.session_id,
            secrets.ikm().as_ref(),
            self.role,
            self.negotiated,
        ))
    }
}

fn rekey_init_signing_data(session_id: &SessionId, msg: &RekeyInitMessage) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/rekey/init");
    hasher.update(session_id);
    hasher.update(msg.epoch.to_be_bytes());
    hasher.update(&msg.mlkem_public);
    hasher.update(msg.x25519_public);
    hasher.update(msg.nonce);
    hasher.finalize().to_vec()
}

fn rekey_ack_signing_data(session_id: &SessionId, msg: &RekeyAckMessage) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"sm/rekey/ack");
    hasher.update(session_id);
    hasher.update(msg.epoch.to_be_bytes());
    hasher.update(&msg.mlkem_ciphertext);
    hasher.update(msg.x25519_public);
    hasher.update(msg.nonce);
    hasher.finalize().to_vec()
}
