//! Relay connection
//!
//! The relay is untrusted-but-available: an opaque bidirectional WSS
//! channel to a named peer. TLS is optional here (the relay proves
//! nothing about the peer); session security comes entirely from the
//! handshake that runs over this channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream};
use tracing::info;

use crate::config::RelayConfig;
use crate::error::{Result, TunnelError};
use crate::transport::{ws_config, TransportKind, WsChannel};

/// Dial the configured relay endpoint.
pub async fn connect(
    cfg: &RelayConfig,
    deadline: Duration,
) -> Result<WsChannel<MaybeTlsStream<TcpStream>>> {
    let connector = match &cfg.ca_der {
        Some(der) => Some(pinned_ca_connector(der)?),
        None => None,
    };

    let (ws, _response) = tokio::time::timeout(
        deadline,
        connect_async_tls_with_config(cfg.url.as_str(), Some(ws_config()), true, connector),
    )
    .await
    .map_err(|_| TunnelError::Timeout("relay dial"))?
    .map_err(|e| TunnelError::Transport(format!("relay dial failed: {e}")))?;

    let peer = match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0.peer_addr().ok(),
        _ => None,
    };

    info!(url = %cfg.url, peer = ?peer, "connected to relay");
    Ok(WsChannel::new(ws, TransportKind::Relay, peer))
}

/// TLS configuration trusting exactly the operator-provided relay CA.
fn pinned_ca_connector(ca_der: &[u8]) -> Result<Connector> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(ca_der.to_vec()))
        .map_err(|e| TunnelError::Config(format!("relay ca certificate rejected: {e}")))?;
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(tls)))
}
