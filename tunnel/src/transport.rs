//! WebSocket transport
//!
//! A transport starts life as a [`WsChannel`] with direct request/response
//! access (handshakes run here), then upgrades into an [`ActiveTransport`]:
//! a reader/writer task pair bridged by bounded channels. All transports
//! feed one shared inbound channel, which is what lets inbound traffic
//! transiently arrive from two transports during migration while outbound
//! stays bound to exactly one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HandshakeError, Result, TunnelError};
use crate::pipeline::QUEUE_DEPTH;
use crate::types::PeerAddress;
use crate::wire::{decode_record, encode_record, Record};

/// Keepalive ping cadence; two unanswered pings declare the transport dead.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Send/receive buffer sizing. High-latency paths head-of-line block
/// below 2 MiB.
const WRITE_BUFFER_SIZE: usize = 2 * 1024 * 1024;
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Which path a transport takes to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Relay,
    Direct,
}

/// WebSocket options shared by every transport the core opens.
pub fn ws_config() -> WebSocketConfig {
    let mut cfg = WebSocketConfig::default();
    cfg.write_buffer_size = WRITE_BUFFER_SIZE;
    cfg.max_write_buffer_size = 2 * WRITE_BUFFER_SIZE;
    cfg.max_message_size = Some(MAX_MESSAGE_SIZE);
    cfg.max_frame_size = Some(MAX_MESSAGE_SIZE);
    cfg
}

/// An established WebSocket with synchronous record access.
pub struct WsChannel<S> {
    ws: WebSocketStream<S>,
    kind: TransportKind,
    peer: Option<SocketAddr>,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, kind: TransportKind, peer: Option<SocketAddr>) -> Self {
        Self { ws, kind, peer }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_record(&mut self, record: &Record) -> Result<()> {
        let bytes = encode_record(record)?;
        self.ws
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Receive the next binary record, skipping control frames.
    pub async fn recv_record(&mut self) -> Result<Record> {
        while let Some(message) = self.ws.next().await {
            match message.map_err(|e| TunnelError::Transport(e.to_string()))? {
                Message::Binary(bytes) => return decode_record(&bytes),
                Message::Close(_) => {
                    return Err(TunnelError::Handshake(HandshakeError::ConnectionClosed))
                }
                // Pings are answered by the protocol layer.
                _ => continue,
            }
        }
        Err(TunnelError::Handshake(HandshakeError::ConnectionClosed))
    }

    /// Upgrade to a running transport: spawn the reader/writer pair.
    ///
    /// Inbound payloads land on `inbound_tx` tagged with this transport's
    /// kind; lifecycle notifications land on `events_tx`.
    pub fn into_active(
        self,
        inbound_tx: mpsc::Sender<TransportInbound>,
        events_tx: mpsc::Sender<TransportEvent>,
        keepalive: Duration,
    ) -> ActiveTransport {
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let missed_pongs = Arc::new(AtomicU32::new(0));
        let (sink, stream) = self.ws.split();

        let reader = tokio::spawn(reader_task(
            stream,
            inbound_tx,
            events_tx.clone(),
            missed_pongs.clone(),
            self.kind,
            cancel.clone(),
        ));
        let writer = tokio::spawn(writer_task(
            sink,
            outbound_rx,
            events_tx,
            missed_pongs,
            self.kind,
            keepalive,
            cancel.clone(),
        ));

        ActiveTransport {
            kind: self.kind,
            peer: self.peer.map(PeerAddress::from),
            outbound: outbound_tx,
            cancel,
            tasks: vec![reader, writer],
        }
    }
}

/// One inbound WebSocket payload, tagged with its source transport.
pub struct TransportInbound {
    pub kind: TransportKind,
    pub payload: Vec<u8>,
}

/// Transport lifecycle notifications.
#[derive(Debug)]
pub enum TransportEvent {
    /// Keepalive or I/O failure; the transport is unusable
    Dead {
        kind: TransportKind,
        reason: String,
    },
    /// Orderly close from the peer
    Closed { kind: TransportKind },
}

/// A running transport bound to its reader/writer tasks.
pub struct ActiveTransport {
    kind: TransportKind,
    peer: Option<PeerAddress>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveTransport {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.peer
    }

    /// Queue one payload. Blocks under backpressure rather than dropping;
    /// errors only when the writer task is gone.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| TunnelError::Transport("transport writer gone".into()))
    }

    /// Sender handle for use without holding the transport.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound.clone()
    }

    /// Wait (bounded) for the queued payloads to reach the writer.
    pub async fn flush_outbound(&self, bound: Duration) {
        let deadline = Instant::now() + bound;
        while self.outbound.capacity() < self.outbound.max_capacity() {
            if Instant::now() >= deadline {
                debug!(kind = ?self.kind, "flush bound reached with frames still queued");
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Graceful close: stop both tasks (the writer sends a Close frame on
    /// its way out) and join them.
    pub async fn close(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if task.await.is_err() {
                warn!("transport task panicked during close");
            }
        }
    }
}

async fn reader_task<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound_tx: mpsc::Sender<TransportInbound>,
    events_tx: mpsc::Sender<TransportEvent>,
    missed_pongs: Arc<AtomicU32>,
    kind: TransportKind,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    if inbound_tx
                        .send(TransportInbound { kind, payload })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs.store(0, Ordering::Relaxed);
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events_tx.send(TransportEvent::Closed { kind }).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events_tx
                        .send(TransportEvent::Dead {
                            kind,
                            reason: e.to_string(),
                        })
                        .await;
                    break;
                }
            },
        }
    }
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<TransportEvent>,
    missed_pongs: Arc<AtomicU32>,
    kind: TransportKind,
    keepalive: Duration,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut pings = interval_at(Instant::now() + keepalive, keepalive);
    pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Graceful close: announce, flush, stop.
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.flush().await;
                break;
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Binary(payload)).await {
                        let _ = events_tx
                            .send(TransportEvent::Dead { kind, reason: e.to_string() })
                            .await;
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.flush().await;
                    break;
                }
            },
            _ = pings.tick() => {
                if missed_pongs.load(Ordering::Relaxed) >= 2 {
                    let _ = events_tx
                        .send(TransportEvent::Dead {
                            kind,
                            reason: "two keepalive pings unanswered".into(),
                        })
                        .await;
                    break;
                }
                missed_pongs.fetch_add(1, Ordering::Relaxed);
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    let _ = events_tx
                        .send(TransportEvent::Dead { kind, reason: "ping write failed".into() })
                        .await;
                    break;
                }
            }
        }
    }
}
