//! Tunnel service
//!
//! Wires the pieces into one running tunnel: relay dial, handshake,
//! pipeline, manager, rotation driver and the direct-P2P supervisor. The
//! TAP handle is injected so privileged device creation stays at the
//! caller's edge ([`crate::tap::TapDevice::create`] followed by
//! [`crate::tap::TapDevice::start`]).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crypto::{HybridSigningKey, PeerId};

use crate::config::TunnelConfig;
use crate::direct::{self, DirectListener, ListenerIdentity, SharedKeys};
use crate::error::Result;
use crate::handshake::{self, HandshakeConfig, RekeyDriver, SessionEstablished};
use crate::manager::{self, ControlEvent, ManagerParams, TunnelHandle};
use crate::nat::{NatCache, NatProber};
use crate::pipeline::{Pipeline, RotationPolicy, QUEUE_DEPTH};
use crate::relay;
use crate::state::{ConnState, StateMachine};
use crate::tap::TapHandle;
use crate::telemetry::{StatsSnapshot, TunnelStats};
use crate::transport::KEEPALIVE_INTERVAL;
use crate::types::{Negotiated, RemotePeer, Role, SessionId};
use crate::wire::{decode_body, encode_body, FrameKind, RekeyAckMessage, RekeyInitMessage};

/// Rendezvous hint offered to initiators.
const DEFAULT_PUNCH_DELAY: Duration = Duration::from_millis(20);

/// Tracks authentication failures per peer and refuses further attempts
/// inside the cool-down window, so a misconfigured or hostile peer
/// cannot drive a log storm of signature failures. Owned by whoever
/// drives reconnect attempts; the core keeps no global state.
pub struct AuthCooldown {
    window: Duration,
    failures: std::sync::Mutex<std::collections::HashMap<PeerId, std::time::Instant>>,
}

impl Default for AuthCooldown {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl AuthCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Whether an attempt against `peer` is currently allowed.
    pub fn check(&self, peer: PeerId) -> Result<()> {
        let failures = self.failures.lock().expect("cooldown lock poisoned");
        if let Some(at) = failures.get(&peer) {
            if at.elapsed() < self.window {
                return Err(crate::error::TunnelError::Auth(
                    "peer in authentication cool-down",
                ));
            }
        }
        Ok(())
    }

    /// Record the outcome of an attempt; only authentication and pin
    /// failures arm the cool-down.
    pub fn record(&self, peer: PeerId, error: &crate::error::TunnelError) {
        use crate::error::TunnelError;
        if matches!(error, TunnelError::Auth(_) | TunnelError::Pin(_)) {
            self.failures
                .lock()
                .expect("cooldown lock poisoned")
                .insert(peer, std::time::Instant::now());
        }
    }
}

/// One running tunnel: session, datapath, and supervision tasks.
pub struct TunnelService {
    handle: Arc<TunnelHandle>,
    peer: RemotePeer,
    listener: Option<DirectListener>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TunnelService {
    /// Establish a session through the relay and start the datapath.
    ///
    /// `role` picks the handshake side; the initiator also dials direct
    /// once the session settles.
    pub async fn connect(
        config: TunnelConfig,
        identity: Arc<HybridSigningKey>,
        tap: TapHandle,
        prober: Box<dyn NatProber>,
        role: Role,
        expected_peer: Option<PeerId>,
        cooldown: Option<&AuthCooldown>,
    ) -> Result<TunnelService> {
        config.validate()?;
        if let (Some(cooldown), Some(peer)) = (cooldown, expected_peer) {
            cooldown.check(peer)?;
        }

        let stats = Arc::new(TunnelStats::default());
        let state = Arc::new(StateMachine::new(stats.clone()));
        state.transition(ConnState::Connecting)?;

        let cancel = CancellationToken::new();
        let nat = Arc::new(NatCache::new(prober));
        let local_nat = match nat.probe().await {
            Ok(probe) => Some(probe.nat_type),
            Err(e) => {
                warn!(error = %e, "nat probe failed; direct feasibility unknown");
                None
            }
        };

        // The listener must exist before the handshake so its
        // advertisement can ride in it.
        let shared_keys: SharedKeys = Arc::new(std::sync::RwLock::new(None));
        let (accepted_tx, accepted_rx) = mpsc::channel(4);
        let (listener, advert) = if config.direct.enabled {
            let listener_identity = ListenerIdentity::generate(&identity)?;
            let listener = DirectListener::bind(
                &listener_identity,
                shared_keys.clone(),
                accepted_tx,
                config.timeouts.rehandshake,
                cancel.child_token(),
            )
            .await?;
            let advert = listener_identity.advertisement(listener.port(), local_nat);
            (Some(listener), Some(advert))
        } else {
            (None, None)
        };

        // Relay dial and the four-message handshake.
        let mut channel = relay::connect(&config.relay, config.timeouts.handshake).await?;
        let handshake_cfg = HandshakeConfig {
            identity: identity.clone(),
            client_id: identity.peer_id(),
            negotiated: Negotiated {
                mtu: config.tap.mtu,
                heartbeat_interval: config.timeouts.health_interval,
                key_rotation_interval: config.crypto.key_rotation_interval,
            },
            timeout: config.timeouts.handshake,
            direct: advert,
            expected_peer,
            punch_delay: DEFAULT_PUNCH_DELAY,
        };
        let result = match role {
            Role::Initiator => handshake::initiate(&mut channel, &handshake_cfg).await,
            Role::Responder => handshake::respond(&mut channel, &handshake_cfg).await,
        };
        let established: SessionEstablished = match result {
            Ok(established) => established,
            Err(e) => {
                if let (Some(cooldown), Some(peer)) = (cooldown, expected_peer) {
                    cooldown.record(peer, &e);
                }
                let _ = state.transition(ConnState::Disconnected);
                return Err(e);
            }
        };
        state.transition(ConnState::RelayEstablished)?;

        *shared_keys.write().expect("shared keys lock poisoned") =
            Some(established.keys.clone());

        // Datapath.
        let policy = RotationPolicy {
            enabled: config.crypto.enable_key_rotation,
            ..RotationPolicy::default()
        };
        let pipeline = Arc::new(Pipeline::new(
            &established.keys,
            established.role,
            policy,
            stats.clone(),
        ));

        let (net_tx, net_rx) = mpsc::channel(QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(16);
        let initial_transport = channel.into_active(net_tx.clone(), events_tx.clone(), KEEPALIVE_INTERVAL);

        let heartbeat = established.keys.heartbeat_interval;
        let rotation_interval = established.keys.key_rotation_interval;
        let session_negotiated = Negotiated {
            mtu: established.keys.mtu,
            heartbeat_interval: heartbeat,
            key_rotation_interval: rotation_interval,
        };

        let handle = manager::start(ManagerParams {
            tap,
            pipeline,
            initial_transport,
            net_rx,
            transport_events: events_rx,
            stats,
            state,
            role: established.role,
            heartbeat,
            timeouts: config.timeouts.clone(),
        });

        let mut tasks = Vec::new();

        // In-band key rotation.
        let rekey = RekeyDriver::new(
            identity.clone(),
            established.peer.verify_key.clone(),
            established.keys.session_id,
            established.role,
            session_negotiated,
        );
        tasks.push(spawn_rotation_driver(
            handle.clone(),
            shared_keys.clone(),
            rekey,
            config.crypto.enable_key_rotation,
            rotation_interval,
            established.role,
            cancel.child_token(),
        ));

        // Relay transport supervision: a dead relay leg is re-dialed with
        // the session retained.
        tasks.push(spawn_relay_watchdog(
            handle.clone(),
            config.relay.clone(),
            net_tx.clone(),
            events_tx.clone(),
            config.timeouts.handshake,
            cancel.child_token(),
        ));

        // Direct-path supervision.
        if config.direct.enabled || established.peer.supports_direct {
            tasks.push(direct::spawn(direct::DirectParams {
                swap: handle.swap_handle(),
                peer: established.peer.clone(),
                dialer: established.role == Role::Initiator,
                shared_keys,
                relay_cfg: config.relay.clone(),
                nat,
                punch_delay: established.punch_delay,
                net_inbound_tx: net_tx,
                transport_events_tx: events_tx,
                accepted_rx,
                timeouts: config.timeouts.clone(),
                cancel: cancel.child_token(),
            }));
        }

        info!(
            peer_id = %hex::encode(established.peer.peer_id),
            "tunnel service running"
        );

        Ok(TunnelService {
            handle,
            peer: established.peer,
            listener,
            tasks,
            cancel,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.session_id()
    }

    pub fn peer(&self) -> &RemotePeer {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        self.handle.state()
    }

    /// Read-only snapshot for external telemetry.
    pub async fn snapshot(&self) -> StatsSnapshot {
        self.handle.snapshot().await
    }

    /// Idempotent shutdown: datapath first, then supervision tasks, then
    /// the listener.
    pub async fn shutdown(mut self) {
        self.handle.shutdown().await;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(listener) = self.listener.take() {
            listener.shutdown().await;
        }
    }
}

/// Rotation driver: the session initiator re-keys on the negotiated
/// interval (or when the counter threshold trips); both sides answer
/// peer-opened rounds. The ack is sent under the old epoch, then keys
/// swap, so the peer can always read it; the receive grace period
/// absorbs frames already in flight.
pub fn spawn_rotation_driver(
    handle: Arc<TunnelHandle>,
    shared_keys: SharedKeys,
    mut driver: RekeyDriver,
    enabled: bool,
    rotation_interval: Duration,
    role: Role,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = handle.subscribe();
        let timer_runs = enabled && role == Role::Initiator;
        // The ticker is built even when the timer never runs (the select
        // arm is gated), and interval_at panics on a zero period — a
        // valid state with rotation disabled. Clamp to a non-zero floor.
        let period = rotation_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut round_pending = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick(), if timer_runs => {
                    if !round_pending {
                        round_pending = open_round(&handle, &mut driver).await;
                    }
                }

                event = events.recv() => match event {
                    Ok(ControlEvent::RekeyNeeded) if timer_runs && !round_pending => {
                        round_pending = open_round(&handle, &mut driver).await;
                    }
                    Ok(ControlEvent::RekeyNeeded) if !timer_runs => {
                        // Only one side opens rounds; two concurrent
                        // rounds would derive divergent epochs. This side
                        // waits on the peer's timer, with the counter
                        // hard stop as the backstop.
                        warn!("send counter crossed the rotation threshold; awaiting peer-driven round");
                    }
                    Ok(ControlEvent::RekeyInit(body)) => {
                        let Ok(msg) = decode_body::<RekeyInitMessage>(&body) else {
                            warn!("undecodable rekey init");
                            continue;
                        };
                        match driver.handle_init(&msg) {
                            Ok((ack, new_keys)) => {
                                let Ok(ack_body) = encode_body(&ack) else { continue };
                                if handle
                                    .send_control(FrameKind::RekeyAck, ack_body)
                                    .await
                                    .is_err()
                                {
                                    warn!("failed to answer rekey round");
                                    continue;
                                }
                                if handle.rotate_keys(new_keys.clone()).await.is_ok() {
                                    *shared_keys.write().expect("shared keys lock poisoned") =
                                        Some(new_keys);
                                }
                            }
                            Err(e) => warn!(error = %e, "rejected rekey init"),
                        }
                    }
                    Ok(ControlEvent::RekeyAck(body)) if round_pending => {
                        round_pending = false;
                        let Ok(msg) = decode_body::<RekeyAckMessage>(&body) else {
                            warn!("undecodable rekey ack");
                            continue;
                        };
                        match driver.handle_ack(&msg) {
                            Ok(new_keys) => {
                                if handle.rotate_keys(new_keys.clone()).await.is_ok() {
                                    *shared_keys.write().expect("shared keys lock poisoned") =
                                        Some(new_keys);
                                }
                            }
                            Err(e) => warn!(error = %e, "rejected rekey ack"),
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Relay watchdog: when the relay transport dies while it carries the
/// session, walk Reconnecting -> Connecting and re-dial with backoff.
/// Session keys and counters are untouched; only the transport is new.
fn spawn_relay_watchdog(
    handle: Arc<TunnelHandle>,
    relay_cfg: crate::config::RelayConfig,
    net_tx: mpsc::Sender<crate::transport::TransportInbound>,
    events_tx: mpsc::Sender<crate::transport::TransportEvent>,
    dial_deadline: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    const BACKOFF_BASE: Duration = Duration::from_secs(2);
    const BACKOFF_MAX: Duration = Duration::from_secs(30);

    tokio::spawn(async move {
        let mut events = handle.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ControlEvent::TransportDead(crate::transport::TransportKind::Relay)) => {
                    if handle.state() != ConnState::RelayEstablished {
                        // The direct path carries the session; the direct
                        // supervisor owns relay re-opens from here.
                        continue;
                    }
                    let machine = handle.state_machine();
                    if machine.transition(ConnState::Reconnecting).is_err() {
                        continue;
                    }
                    let _ = machine.transition(ConnState::Connecting);

                    let mut backoff = BACKOFF_BASE;
                    loop {
                        if cancel.is_cancelled() {
                            return;
                        }
                        match relay::connect(&relay_cfg, dial_deadline).await {
                            Ok(channel) => {
                                let active = channel.into_active(
                                    net_tx.clone(),
                                    events_tx.clone(),
                                    KEEPALIVE_INTERVAL,
                                );
                                match handle.swap_handle().swap_transport(active).await {
                                    Ok(dead) => {
                                        dead.close().await;
                                        let _ = machine.transition(ConnState::RelayEstablished);
                                        info!("relay transport re-established");
                                        break;
                                    }
                                    Err(_) => return,
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "relay redial failed, backing off");
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(backoff) => {}
                                }
                                backoff = (backoff * 2).min(BACKOFF_MAX);
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn open_round(handle: &TunnelHandle, driver: &mut RekeyDriver) -> bool {
    match driver.initiate() {
        Ok(msg) => match encode_body(&msg) {
            Ok(body) => handle
                .send_control(FrameKind::RekeyInit, body)
                .await
                .is_ok(),
            Err(_) => false,
        },
        Err(e) => {
            warn!(error = %e, "failed to open rekey round");
            false
        }
    }
}
