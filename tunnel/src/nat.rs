//! NAT oracle and hole-punch adapter
//!
//! The STUN probing itself is an external collaborator; the core injects
//! a [`NatProber`] and treats its verdicts as authoritative, cached for
//! the session and refreshed only after degradation. The adapter's job
//! is the simultaneous-open warmup: open the local cone mapping toward
//! the peer just before the WSS dial, inside the dial budget.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::Result;

/// NAT classification as reported by the external prober.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    NoNat,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
}

/// One probe verdict.
#[derive(Clone, Copy, Debug)]
pub struct NatProbe {
    pub nat_type: NatType,
    pub public_endpoint: Option<SocketAddr>,
}

/// External NAT-type oracle.
#[async_trait]
pub trait NatProber: Send + Sync {
    async fn probe(&self) -> Result<NatProbe>;
}

/// A prober with a fixed answer; used where probing is disabled and in
/// tests.
pub struct StaticProber(pub NatProbe);

#[async_trait]
impl NatProber for StaticProber {
    async fn probe(&self) -> Result<NatProbe> {
        Ok(self.0)
    }
}

/// Whether a direct path is worth attempting for this NAT pairing.
/// Symmetric NAT on either end short-circuits to infeasible.
pub fn feasible_with(local: NatType, peer: NatType) -> bool {
    !matches!(local, NatType::Symmetric) && !matches!(peer, NatType::Symmetric)
}

/// Session-lifetime cache over the injected prober.
pub struct NatCache {
    prober: Box<dyn NatProber>,
    cached: Mutex<Option<NatProbe>>,
}

impl NatCache {
    pub fn new(prober: Box<dyn NatProber>) -> Self {
        Self {
            prober,
            cached: Mutex::new(None),
        }
    }

    /// Probe once and reuse the verdict for the session's lifetime.
    pub async fn probe(&self) -> Result<NatProbe> {
        if let Some(probe) = *self.cached.lock().expect("nat cache lock poisoned") {
            return Ok(probe);
        }
        let probe = self.prober.probe().await?;
        debug!(nat_type = ?probe.nat_type, endpoint = ?probe.public_endpoint, "nat probe");
        *self.cached.lock().expect("nat cache lock poisoned") = Some(probe);
        Ok(probe)
    }

    /// Drop the cached verdict; called when the session degrades.
    pub fn invalidate(&self) {
        *self.cached.lock().expect("nat cache lock poisoned") = None;
    }
}

/// Number of warmup datagrams sent toward the peer before the dial.
const PUNCH_PACKETS: u32 = 3;
const PUNCH_SPACING: Duration = Duration::from_millis(20);

/// Open the local NAT mapping toward `peer` by sending a few datagrams,
/// honoring the rendezvous `delay` hint from the ESTABLISHED exchange.
/// Best-effort: failures only mean the subsequent dial is less likely to
/// land.
pub async fn warm_path(peer: SocketAddr, delay: Duration) {
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }
    let bind_addr: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid literal")
    } else {
        "[::]:0".parse().expect("valid literal")
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "failed to bind rendezvous socket");
            return;
        }
    };
    for _ in 0..PUNCH_PACKETS {
        if let Err(e) = socket.send_to(b"sm-punch", peer).await {
            warn!(error = %e, "rendezvous datagram failed");
            return;
        }
        tokio::time::sleep(PUNCH_SPACING).await;
    }
    debug!(%peer, "rendezvous warmup sent");
}
