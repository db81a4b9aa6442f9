//! Tunnel manager
//!
//! Owns the TAP handle, the frame pipeline, and the active transport.
//! Two hot loops move frames (TAP → seal → transport, transport → open →
//! TAP); a command loop services transport swaps, key rotations and
//! shutdown. The active transport sits behind a reader-writer lock held
//! only long enough to clone a sender or replace the value — migration
//! swaps the pointer, never the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::error::{Result, TunnelError};
use crate::pipeline::Pipeline;
use crate::state::{ConnState, StateMachine};
use crate::tap::TapHandle;
use crate::telemetry::{StatsSnapshot, TunnelStats};
use crate::transport::{ActiveTransport, TransportEvent, TransportInbound, TransportKind};
use crate::types::{PeerAddress, Role, SessionId, SessionKeys};
use crate::wire::{decode_record, encode_record, FrameKind, Record};

/// Commands accepted by the manager's command loop.
enum ManagerCommand {
    SwapTransport {
        transport: ActiveTransport,
        reply: oneshot::Sender<Result<ActiveTransport>>,
    },
    RotateKeys {
        keys: SessionKeys,
        reply: oneshot::Sender<()>,
    },
    SendControl {
        kind: FrameKind,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    SealControl {
        kind: FrameKind,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications fanned out to interested drivers (rotation, direct-P2P,
/// supervision).
#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// In-tunnel pong answered one of our pings
    PongReceived,
    /// Peer opened a rotation round
    RekeyInit(Vec<u8>),
    /// Peer answered our rotation round
    RekeyAck(Vec<u8>),
    /// Send counter crossed the rotation threshold
    RekeyNeeded,
    /// Peer switched its outbound to the direct path
    DirectActive,
    /// A transport died (keepalive or I/O)
    TransportDead(TransportKind),
    /// A transport closed in an orderly way
    TransportClosed(TransportKind),
    /// Unrecoverable session failure
    Fatal(String),
}

/// Everything the manager needs at start.
pub struct ManagerParams {
    pub tap: TapHandle,
    pub pipeline: Arc<Pipeline>,
    pub initial_transport: ActiveTransport,
    pub net_rx: mpsc::Receiver<TransportInbound>,
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub stats: Arc<TunnelStats>,
    pub state: Arc<StateMachine>,
    pub role: Role,
    pub heartbeat: std::time::Duration,
    pub timeouts: Timeouts,
}

/// Running tunnel manager handle.
pub struct TunnelHandle {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    control_tx: broadcast::Sender<ControlEvent>,
    active: Arc<RwLock<Option<ActiveTransport>>>,
    stats: Arc<TunnelStats>,
    state: Arc<StateMachine>,
    session_id: SessionId,
    cancel: CancellationToken,
    tap_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

/// The narrow capability handed to the direct-P2P manager: swap the
/// transport, seal/send control frames, observe state. Nothing else.
#[derive(Clone)]
pub struct TransportSwapHandle {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    control_tx: broadcast::Sender<ControlEvent>,
    state: Arc<StateMachine>,
    stats: Arc<TunnelStats>,
}

impl TransportSwapHandle {
    /// Atomically rebind outbound to `transport`; returns the previous
    /// transport (still open) for the caller to dispose of.
    pub async fn swap_transport(&self, transport: ActiveTransport) -> Result<ActiveTransport> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::SwapTransport { transport, reply })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)?
    }

    /// Seal a control frame for sending over a transport the caller owns.
    pub async fn seal_control(&self, kind: FrameKind, body: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::SealControl { kind, body, reply })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)?
    }

    /// Seal and send a control frame over the active transport.
    pub async fn send_control(&self, kind: FrameKind, body: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::SendControl { kind, body, reply })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnState {
        self.state.current()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }
}

/// Start the manager's task set over an established session.
pub fn start(params: ManagerParams) -> Arc<TunnelHandle> {
    let cancel = CancellationToken::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (control_tx, _) = broadcast::channel(64);

    let ManagerParams {
        tap,
        pipeline,
        initial_transport,
        net_rx,
        transport_events,
        stats,
        state,
        role,
        heartbeat,
        timeouts,
    } = params;

    let session_id = pipeline.session_id();
    let active = Arc::new(RwLock::new(Some(initial_transport)));

    let mut tasks = Vec::new();

    let TapHandle {
        inbound: tap_inbound,
        outbound: tap_outbound,
        tasks: tap_tasks,
        name: tap_name,
        cancel: tap_cancel,
        ..
    } = tap;
    tasks.extend(tap_tasks);
    debug!(interface = %tap_name, "tunnel manager starting");

    tasks.push(tokio::spawn(outbound_loop(
        tap_inbound,
        pipeline.clone(),
        active.clone(),
        stats.clone(),
        state.clone(),
        control_tx.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(inbound_loop(
        net_rx,
        pipeline.clone(),
        active.clone(),
        tap_outbound,
        stats.clone(),
        control_tx.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(command_loop(
        cmd_rx,
        transport_events,
        pipeline,
        active.clone(),
        control_tx.clone(),
        role,
        heartbeat,
        timeouts,
        cancel.clone(),
    )));

    Arc::new(TunnelHandle {
        cmd_tx,
        control_tx,
        active,
        stats,
        state,
        session_id,
        cancel,
        tap_cancel,
        tasks: Mutex::new(tasks),
        shutdown_started: AtomicBool::new(false),
    })
}

impl TunnelHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> ConnState {
        self.state.current()
    }

    pub fn state_machine(&self) -> Arc<StateMachine> {
        self.state.clone()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.control_tx.subscribe()
    }

    /// The narrow swap capability for the direct-P2P manager.
    pub fn swap_handle(&self) -> TransportSwapHandle {
        TransportSwapHandle {
            cmd_tx: self.cmd_tx.clone(),
            control_tx: self.control_tx.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Atomically install a new epoch's keys.
    pub async fn rotate_keys(&self, keys: SessionKeys) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::RotateKeys { keys, reply })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)
    }

    pub async fn send_control(&self, kind: FrameKind, body: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::SendControl { kind, body, reply })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)?
    }

    pub async fn peer_address(&self) -> Option<PeerAddress> {
        self.active.read().await.as_ref().and_then(|t| t.peer_address())
    }

    /// Read-only snapshot for external telemetry.
    pub async fn snapshot(&self) -> StatsSnapshot {
        let peer = self.peer_address().await;
        self.stats.snapshot(Some(self.session_id), peer)
    }

    /// Idempotent shutdown: drain outbound (bounded), stop every task,
    /// close the transport, release the session.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            // Double close is a no-op; wait for the first one.
            self.cancel.cancelled().await;
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ManagerCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.tap_cancel.cancel();
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if task.await.is_err() {
                warn!("tunnel task panicked during shutdown");
            }
        }
        info!("tunnel shut down");
    }
}

async fn active_sender(
    active: &RwLock<Option<ActiveTransport>>,
) -> Option<mpsc::Sender<Vec<u8>>> {
    active.read().await.as_ref().map(|t| t.sender())
}

async fn outbound_loop(
    mut tap_inbound: mpsc::Receiver<Vec<u8>>,
    pipeline: Arc<Pipeline>,
    active: Arc<RwLock<Option<ActiveTransport>>>,
    stats: Arc<TunnelStats>,
    state: Arc<StateMachine>,
    control_tx: broadcast::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    let mut rekey_signalled = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = tap_inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let encrypted = match pipeline.seal(FrameKind::Data, &frame) {
            Ok(encrypted) => encrypted,
            Err(TunnelError::CounterExhausted) => {
                error!("send counter exhausted with rotation unavailable");
                pipeline.close();
                let _ = control_tx.send(ControlEvent::Fatal("counter exhausted".into()));
                let _ = state.transition_or_stay(ConnState::Closed);
                break;
            }
            Err(TunnelError::SessionClosed) => break,
            Err(TunnelError::MalformedFrame(len)) => {
                stats.record_malformed();
                debug!(len, "oversized frame from tap discarded");
                continue;
            }
            Err(_) => {
                stats.record_encrypt_error();
                continue;
            }
        };

        let record = match encode_record(&Record::Frame(encrypted)) {
            Ok(record) => record,
            Err(_) => {
                stats.record_encrypt_error();
                continue;
            }
        };

        // Lock held only to clone the sender; the send itself runs
        // unlocked so a migration can take the write lock between frames.
        match active_sender(&active).await {
            Some(sender) => {
                if sender.send(record).await.is_err() {
                    stats.record_dropped();
                    warn!("active transport gone; frame dropped");
                    let _ = state.transition_or_stay(ConnState::Reconnecting);
                } else {
                    stats.record_sent(frame.len());
                }
            }
            None => {
                stats.record_dropped();
            }
        }

        if pipeline.needs_rotation() && !rekey_signalled {
            rekey_signalled = true;
            let _ = control_tx.send(ControlEvent::RekeyNeeded);
        } else if !pipeline.needs_rotation() {
            rekey_signalled = false;
        }
    }
}

async fn inbound_loop(
    mut net_rx: mpsc::Receiver<TransportInbound>,
    pipeline: Arc<Pipeline>,
    active: Arc<RwLock<Option<ActiveTransport>>>,
    tap_outbound: mpsc::Sender<Vec<u8>>,
    stats: Arc<TunnelStats>,
    control_tx: broadcast::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = net_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        let frame = match decode_record(&inbound.payload) {
            Ok(Record::Frame(frame)) => frame,
            Ok(_) => continue, // stray handshake records post-establishment
            Err(_) => {
                stats.record_malformed();
                continue;
            }
        };

        // Failures inside open() are counted there and never surfaced.
        let Some(opened) = pipeline.open(&frame) else {
            continue;
        };

        match opened.kind {
            FrameKind::Data => {
                let len = opened.payload.len();
                // The network is the bottleneck here: a full injection
                // queue drops rather than stalling decryption.
                match tap_outbound.try_send(opened.payload) {
                    Ok(()) => stats.record_received(len),
                    Err(mpsc::error::TrySendError::Full(_)) => stats.record_dropped(),
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            FrameKind::Ping => {
                if let Ok(pong) = pipeline.seal(FrameKind::Pong, &[]) {
                    if let Ok(record) = encode_record(&Record::Frame(pong)) {
                        if let Some(sender) = active_sender(&active).await {
                            let _ = sender.send(record).await;
                        }
                    }
                }
            }
            FrameKind::Pong => {
                let _ = control_tx.send(ControlEvent::PongReceived);
            }
            FrameKind::RekeyInit => {
                let _ = control_tx.send(ControlEvent::RekeyInit(opened.payload));
            }
            FrameKind::RekeyAck => {
                let _ = control_tx.send(ControlEvent::RekeyAck(opened.payload));
            }
            FrameKind::DirectActive => {
                let _ = control_tx.send(ControlEvent::DirectActive);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn command_loop(
    mut cmd_rx: mpsc::Receiver<ManagerCommand>,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    pipeline: Arc<Pipeline>,
    active: Arc<RwLock<Option<ActiveTransport>>>,
    control_tx: broadcast::Sender<ControlEvent>,
    role: Role,
    heartbeat: std::time::Duration,
    timeouts: Timeouts,
    cancel: CancellationToken,
) {
    let mut events_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = transport_events.recv(), if events_open => match event {
                Some(TransportEvent::Dead { kind, reason }) => {
                    warn!(?kind, reason, "transport dead");
                    let _ = control_tx.send(ControlEvent::TransportDead(kind));
                }
                Some(TransportEvent::Closed { kind }) => {
                    let _ = control_tx.send(ControlEvent::TransportClosed(kind));
                }
                None => events_open = false,
            },
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    ManagerCommand::SwapTransport { transport, reply } => {
                        // Bounded flush of in-flight frames, then the
                        // atomic pointer swap under the write lock.
                        if let Some(current) = active.read().await.as_ref() {
                            current.flush_outbound(timeouts.migration_flush).await;
                        }
                        let old = {
                            let mut guard = active.write().await;
                            guard.replace(transport)
                        };
                        let result = old.ok_or(TunnelError::SessionClosed);
                        let _ = reply.send(result);
                    }
                    ManagerCommand::RotateKeys { keys, reply } => {
                        pipeline.rotate(&keys, role, heartbeat);
                        info!("session keys rotated");
                        let _ = reply.send(());
                    }
                    ManagerCommand::SealControl { kind, body, reply } => {
                        let sealed = pipeline
                            .seal(kind, &body)
                            .and_then(|f| encode_record(&Record::Frame(f)));
                        let _ = reply.send(sealed);
                    }
                    ManagerCommand::SendControl { kind, body, reply } => {
                        let result = async {
                            let frame = pipeline.seal(kind, &body)?;
                            let record = encode_record(&Record::Frame(frame))?;
                            match active_sender(&active).await {
                                Some(sender) => sender
                                    .send(record)
                                    .await
                                    .map_err(|_| TunnelError::Transport("writer gone".into())),
                                None => Err(TunnelError::SessionClosed),
                            }
                        }
                        .await;
                        let _ = reply.send(result);
                    }
                    ManagerCommand::Shutdown { reply } => {
                        if let Some(current) = active.read().await.as_ref() {
                            current.flush_outbound(timeouts.shutdown_drain).await;
                        }
                        if let Some(old) = active.write().await.take() {
                            old.close().await;
                        }
                        pipeline.close();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
    }
}
