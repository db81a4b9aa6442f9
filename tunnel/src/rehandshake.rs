//! HMAC re-handshake
//!
//! Three messages over a freshly established direct TLS channel prove
//! that both ends hold the live session's direction keys, binding the
//! new transport to the session with no public-key operations on the
//! path. Each HMAC is keyed by the sender's transmit key, so the
//! verifier checks with its receive key.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{HandshakeError, Result, TunnelError};
use crate::transport::WsChannel;
use crate::types::{SessionId, SessionKeys};
use crate::wire::{
    Record, RehandshakeComplete, RehandshakeMessage, RehandshakeRequest, RehandshakeResponse,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated clock skew on re-handshake timestamps.
pub const REHANDSHAKE_SKEW: Duration = Duration::from_secs(30);

/// Drive the initiator side; `deadline` bounds the whole exchange.
pub async fn run_initiator<S>(
    channel: &mut WsChannel<S>,
    keys: &SessionKeys,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(deadline, initiator_exchange(channel, keys))
        .await
        .map_err(|_| TunnelError::Timeout("rehandshake"))?
}

/// Drive the responder side; `deadline` bounds the whole exchange.
pub async fn run_responder<S>(
    channel: &mut WsChannel<S>,
    keys: &SessionKeys,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(deadline, responder_exchange(channel, keys))
        .await
        .map_err(|_| TunnelError::Timeout("rehandshake"))?
}

async fn initiator_exchange<S>(channel: &mut WsChannel<S>, keys: &SessionKeys) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = build_request(keys.session_id, &keys.tx_key);
    let nonce_r = request.nonce;
    channel
        .send_record(&Record::Rehandshake(RehandshakeMessage::Request(
            request.clone(),
        )))
        .await?;

    let response = match recv_rehandshake(channel).await? {
        RehandshakeMessage::Response(msg) => msg,
        other => {
            return Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
                expected: "RESPONSE",
                got: other.message_type(),
            }))
        }
    };
    verify_response(&response, &nonce_r, keys.session_id, &keys.rx_key)?;

    let complete = build_complete(keys.session_id, &keys.tx_key, &nonce_r, &response.nonce);
    channel
        .send_record(&Record::Rehandshake(RehandshakeMessage::Complete(complete)))
        .await?;
    debug!("rehandshake complete (initiator)");
    Ok(())
}

async fn responder_exchange<S>(channel: &mut WsChannel<S>, keys: &SessionKeys) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = match recv_rehandshake(channel).await? {
        RehandshakeMessage::Request(msg) => msg,
        other => {
            return Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
                expected: "REQUEST",
                got: other.message_type(),
            }))
        }
    };
    verify_request(&request, keys.session_id, &keys.rx_key)?;

    let response = build_response(&request, &keys.tx_key, keys.session_id);
    let nonce_s = response.nonce;
    channel
        .send_record(&Record::Rehandshake(RehandshakeMessage::Response(response)))
        .await?;

    let complete = match recv_rehandshake(channel).await? {
        RehandshakeMessage::Complete(msg) => msg,
        other => {
            return Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
                expected: "COMPLETE",
                got: other.message_type(),
            }))
        }
    };
    verify_complete(
        &complete,
        keys.session_id,
        &keys.rx_key,
        &request.nonce,
        &nonce_s,
    )?;
    debug!("rehandshake complete (responder)");
    Ok(())
}

async fn recv_rehandshake<S>(channel: &mut WsChannel<S>) -> Result<RehandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match channel.recv_record().await? {
        Record::Rehandshake(msg) => Ok(msg),
        _ => Err(TunnelError::Handshake(HandshakeError::UnexpectedMessage {
            expected: "rehandshake record",
            got: "other record",
        })),
    }
}

/// Build the opening REQUEST keyed by this endpoint's transmit key.
pub fn build_request(session_id: SessionId, tx_key: &[u8; 32]) -> RehandshakeRequest {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let timestamp = unix_now();
    let hmac = request_mac(tx_key, &session_id, &nonce, timestamp);
    RehandshakeRequest {
        session_id,
        nonce,
        timestamp,
        hmac,
    }
}

/// Verify a REQUEST against the live session.
pub fn verify_request(
    request: &RehandshakeRequest,
    session_id: SessionId,
    rx_key: &[u8; 32],
) -> Result<()> {
    if request.session_id != session_id {
        return Err(TunnelError::SessionMismatch);
    }
    check_skew(request.timestamp)?;
    let expected = request_mac(rx_key, &session_id, &request.nonce, request.timestamp);
    verify_mac(&expected, &request.hmac, "REQUEST")
}

/// Build the RESPONSE, echoing the request nonce for freshness.
pub fn build_response(
    request: &RehandshakeRequest,
    tx_key: &[u8; 32],
    session_id: SessionId,
) -> RehandshakeResponse {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let timestamp = unix_now();
    let hmac = response_mac(tx_key, &session_id, &request.nonce, &nonce, timestamp);
    RehandshakeResponse {
        nonce,
        echo_nonce: request.nonce,
        timestamp,
        hmac,
    }
}

/// Verify a RESPONSE against the REQUEST this endpoint sent.
pub fn verify_response(
    response: &RehandshakeResponse,
    nonce_r: &[u8; 32],
    session_id: SessionId,
    rx_key: &[u8; 32],
) -> Result<()> {
    if &response.echo_nonce != nonce_r {
        return Err(TunnelError::Auth("rehandshake nonce echo mismatch"));
    }
    check_skew(response.timestamp)?;
    let expected = response_mac(
        rx_key,
        &session_id,
        nonce_r,
        &response.nonce,
        response.timestamp,
    );
    verify_mac(&expected, &response.hmac, "RESPONSE")
}

pub fn build_complete(
    session_id: SessionId,
    tx_key: &[u8; 32],
    nonce_r: &[u8; 32],
    nonce_s: &[u8; 32],
) -> RehandshakeComplete {
    RehandshakeComplete {
        hmac: complete_mac(tx_key, &session_id, nonce_r, nonce_s),
    }
}

pub fn verify_complete(
    complete: &RehandshakeComplete,
    session_id: SessionId,
    rx_key: &[u8; 32],
    nonce_r: &[u8; 32],
    nonce_s: &[u8; 32],
) -> Result<()> {
    let expected = complete_mac(rx_key, &session_id, nonce_r, nonce_s);
    verify_mac(&expected, &complete.hmac, "COMPLETE")
}

fn request_mac(key: &[u8; 32], session_id: &SessionId, nonce: &[u8; 32], ts: u64) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(session_id);
    mac.update(nonce);
    mac.update(&ts.to_be_bytes());
    mac.finalize().into_bytes().into()
}

fn response_mac(
    key: &[u8; 32],
    session_id: &SessionId,
    nonce_r: &[u8; 32],
    nonce_s: &[u8; 32],
    ts: u64,
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(session_id);
    mac.update(nonce_r);
    mac.update(nonce_s);
    mac.update(&ts.to_be_bytes());
    mac.finalize().into_bytes().into()
}

fn complete_mac(
    key: &[u8; 32],
    session_id: &SessionId,
    nonce_r: &[u8; 32],
    nonce_s: &[u8; 32],
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(session_id);
    mac.update(nonce_r);
    mac.update(nonce_s);
    mac.finalize().into_bytes().into()
}

fn verify_mac(expected: &[u8; 32], presented: &[u8; 32], message: &'static str) -> Result<()> {
    use subtle::ConstantTimeEq;
    if expected.ct_eq(presented).into() {
        Ok(())
    } else {
        warn!(message, "rehandshake hmac verification failed");
        Err(TunnelError::Auth("rehandshake hmac mismatch"))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn check_skew(timestamp: u64) -> Result<()> {
    if unix_now().abs_diff(timestamp) > REHANDSHAKE_SKEW.as_secs() {
        return Err(TunnelError::Timeout("rehandshake clock skew"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Negotiated, Role};

    fn session_pair() -> (SessionKeys, SessionKeys) {
        let negotiated = Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        };
        let ikm = [0x21u8; 64];
        let sid = [8u8; 16];
        (
            SessionKeys::derive(sid, &ikm, Role::Initiator, negotiated),
            SessionKeys::derive(sid, &ikm, Role::Responder, negotiated),
        )
    }

    #[test]
    fn full_exchange_verifies() {
        let (a, b) = session_pair();

        let request = build_request(a.session_id, &a.tx_key);
        verify_request(&request, b.session_id, &b.rx_key).unwrap();

        let response = build_response(&request, &b.tx_key, b.session_id);
        verify_response(&response, &request.nonce, a.session_id, &a.rx_key).unwrap();

        let complete = build_complete(a.session_id, &a.tx_key, &request.nonce, &response.nonce);
        verify_complete(
            &complete,
            b.session_id,
            &b.rx_key,
            &request.nonce,
            &response.nonce,
        )
        .unwrap();
    }

    #[test]
    fn wrong_session_id_aborts() {
        let (a, b) = session_pair();
        let mut request = build_request(a.session_id, &a.tx_key);
        request.session_id = [0xAA; 16];
        assert!(matches!(
            verify_request(&request, b.session_id, &b.rx_key),
            Err(TunnelError::SessionMismatch)
        ));
    }

    #[test]
    fn wrong_key_fails_hmac() {
        let (a, b) = session_pair();
        let request = build_request(a.session_id, &a.rx_key); // wrong direction
        assert!(matches!(
            verify_request(&request, b.session_id, &b.rx_key),
            Err(TunnelError::Auth(_))
        ));
    }

    #[test]
    fn stale_timestamp_is_a_timeout() {
        let (a, b) = session_pair();
        let mut request = build_request(a.session_id, &a.tx_key);
        request.timestamp -= 31;
        // The MAC still matches its contents, but the skew gate fires first.
        let hmac = request_mac(&a.tx_key, &a.session_id, &request.nonce, request.timestamp);
        request.hmac = hmac;
        assert!(matches!(
            verify_request(&request, b.session_id, &b.rx_key),
            Err(TunnelError::Timeout(_))
        ));
    }

    #[test]
    fn nonce_echo_is_checked() {
        let (a, b) = session_pair();
        let request = build_request(a.session_id, &a.tx_key);
        let mut response = build_response(&request, &b.tx_key, b.session_id);
        response.echo_nonce[0] ^= 1;
        assert!(verify_response(&response, &request.nonce, a.session_id, &a.rx_key).is_err());
    }

    #[tokio::test]
    async fn exchange_over_websocket_pair() {
        use crate::transport::{ws_config, TransportKind};
        use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
        use tokio_tungstenite::WebSocketStream;

        let (a_keys, b_keys) = session_pair();
        let (a_io, b_io) = tokio::io::duplex(1 << 16);
        let a_ws = WebSocketStream::from_raw_socket(a_io, WsRole::Client, Some(ws_config())).await;
        let b_ws = WebSocketStream::from_raw_socket(b_io, WsRole::Server, Some(ws_config())).await;
        let mut a_chan = WsChannel::new(a_ws, TransportKind::Direct, None);
        let mut b_chan = WsChannel::new(b_ws, TransportKind::Direct, None);

        let deadline = Duration::from_secs(5);
        let (a_result, b_result) = tokio::join!(
            run_initiator(&mut a_chan, &a_keys, deadline),
            run_responder(&mut b_chan, &b_keys, deadline),
        );
        a_result.unwrap();
        b_result.unwrap();
    }
}
