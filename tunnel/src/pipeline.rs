//! Frame encryption pipeline
//!
//! Each direction has its own key, counter and replay window. The AEAD
//! nonce is `counter(8, big-endian) || direction_tag(4)`; a counter is
//! never reused under one key, and the receiver accepts a frame only
//! after AEAD verification succeeds against the key matching the frame's
//! session and direction. Authentication failures are dropped without a
//! trace on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tracing::trace;

use crate::error::{Result, TunnelError};
use crate::frame::EncryptedFrame;
use crate::telemetry::TunnelStats;
use crate::types::{Role, SessionId, SessionKeys};
use crate::wire::FrameKind;

/// Send counter value that forces a rotation round (default 2^48).
pub const ROTATION_THRESHOLD: u64 = 1 << 48;
/// Send counter hard stop (2^63): rotate before this or terminate.
pub const COUNTER_HARD_LIMIT: u64 = 1 << 63;

/// Bounded queue depth per pipeline direction.
pub const QUEUE_DEPTH: usize = 100;

/// Rotation behavior for a pipeline.
#[derive(Clone, Copy, Debug)]
pub struct RotationPolicy {
    pub enabled: bool,
    pub threshold: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: ROTATION_THRESHOLD,
        }
    }
}

fn nonce_for(counter: u64, tag: [u8; 4]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce[8..].copy_from_slice(&tag);
    nonce
}

/// Sliding window over the most recent 1024 counters, deduplicating
/// deliveries that race across transports during migration.
struct ReplayWindow {
    highest: u64,
    bitmap: [u64; 16],
    initialized: bool,
}

const WINDOW_BITS: u64 = 1024;

impl ReplayWindow {
    fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0u64; 16],
            initialized: false,
        }
    }

    /// Record `counter`; false means duplicate or older than the window.
    fn accept(&mut self, counter: u64) -> bool {
        if !self.initialized {
            self.initialized = true;
            self.highest = counter;
            self.bitmap = [0u64; 16];
            self.set_bit(0);
            return true;
        }
        if counter > self.highest {
            self.shift(counter - self.highest);
            self.highest = counter;
            self.set_bit(0);
            return true;
        }
        let age = self.highest - counter;
        if age >= WINDOW_BITS {
            return false;
        }
        if self.get_bit(age) {
            return false;
        }
        self.set_bit(age);
        true
    }

    fn set_bit(&mut self, idx: u64) {
        self.bitmap[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn get_bit(&self, idx: u64) -> bool {
        (self.bitmap[(idx / 64) as usize] >> (idx % 64)) & 1 == 1
    }

    // Age every recorded bit by `delta` positions.
    fn shift(&mut self, delta: u64) {
        if delta >= WINDOW_BITS {
            self.bitmap = [0u64; 16];
            return;
        }
        let words = (delta / 64) as usize;
        let bits = (delta % 64) as u32;
        for i in (0..16).rev() {
            let mut v = if i >= words { self.bitmap[i - words] } else { 0 };
            if bits > 0 {
                v <<= bits;
                if i > words {
                    v |= self.bitmap[i - words - 1] >> (64 - bits);
                }
            }
            self.bitmap[i] = v;
        }
    }
}

struct FrameSealer {
    cipher: ChaCha20Poly1305,
    tag: [u8; 4],
    counter: u64,
}

struct FrameOpener {
    cipher: ChaCha20Poly1305,
    tag: [u8; 4],
    window: ReplayWindow,
}

impl FrameOpener {
    fn open(&mut self, session_id: &SessionId, frame: &EncryptedFrame) -> Option<Vec<u8>> {
        let nonce_bytes = nonce_for(frame.counter, self.tag);
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &frame.payload,
                    aad: session_id,
                },
            )
            .ok()
    }
}

struct RxState {
    current: FrameOpener,
    /// Previous epoch's opener, kept for one grace period after rotation
    previous: Option<(FrameOpener, Instant)>,
}

/// Both directions of one session's frame encryption.
///
/// The hot path takes one uncontended mutex per frame; rotation takes
/// both locks, swaps ciphers, and releases — neither loop ever observes
/// a half-rotated state.
pub struct Pipeline {
    session_id: SessionId,
    max_plaintext: usize,
    policy: RotationPolicy,
    closed: AtomicBool,
    tx: Mutex<FrameSealer>,
    rx: Mutex<RxState>,
    stats: Arc<TunnelStats>,
}

/// A decrypted, deduplicated inbound frame.
pub struct Opened {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Pipeline {
    pub fn new(
        keys: &SessionKeys,
        role: Role,
        policy: RotationPolicy,
        stats: Arc<TunnelStats>,
    ) -> Self {
        let tx_cipher = ChaCha20Poly1305::new(Key::from_slice(keys.tx_key.as_ref()));
        let rx_cipher = ChaCha20Poly1305::new(Key::from_slice(keys.rx_key.as_ref()));
        Self {
            session_id: keys.session_id,
            max_plaintext: keys.max_plaintext(),
            policy,
            closed: AtomicBool::new(false),
            tx: Mutex::new(FrameSealer {
                cipher: tx_cipher,
                tag: keys.tx_tag(role),
                counter: 0,
            }),
            rx: Mutex::new(RxState {
                current: FrameOpener {
                    cipher: rx_cipher,
                    tag: keys.rx_tag(role),
                    window: ReplayWindow::new(),
                },
                previous: None,
            }),
            stats,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Encrypt one frame in submission order. User data is bounded by the
    /// session MTU plus the Ethernet header; control payloads are small.
    pub fn seal(&self, kind: FrameKind, payload: &[u8]) -> Result<EncryptedFrame> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::SessionClosed);
        }
        if kind == FrameKind::Data && payload.len() > self.max_plaintext {
            return Err(TunnelError::MalformedFrame(payload.len()));
        }

        let mut tx = self.tx.lock().expect("tx lock poisoned");
        if tx.counter >= COUNTER_HARD_LIMIT {
            return Err(TunnelError::CounterExhausted);
        }
        if !self.policy.enabled && tx.counter > self.policy.threshold {
            return Err(TunnelError::CounterExhausted);
        }

        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(kind.as_byte());
        plaintext.extend_from_slice(payload);

        let counter = tx.counter;
        let nonce_bytes = nonce_for(counter, tx.tag);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = tx
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: &self.session_id,
                },
            )
            .map_err(|_| {
                self.stats.record_encrypt_error();
                TunnelError::Crypto(crypto::CryptoError::Malformed {
                    field: "frame",
                    reason: "aead seal failed",
                })
            })?;
        tx.counter += 1;

        Ok(EncryptedFrame {
            session_id: self.session_id,
            counter,
            payload: ciphertext,
        })
    }

    /// Decrypt and deduplicate one inbound frame.
    ///
    /// Returns `None` on any failure: wrong session, failed
    /// authentication, replay, or unknown kind. The failure is counted
    /// but never signalled to the peer.
    pub fn open(&self, frame: &EncryptedFrame) -> Option<Opened> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if frame.session_id != self.session_id {
            self.stats.record_dropped();
            return None;
        }

        let mut rx = self.rx.lock().expect("rx lock poisoned");

        // Expire the previous epoch once its grace period lapses.
        if matches!(&rx.previous, Some((_, expiry)) if Instant::now() >= *expiry) {
            rx.previous = None;
        }

        let session_id = self.session_id;
        let plaintext = match rx.current.open(&session_id, frame) {
            Some(pt) => {
                if !rx.current.window.accept(frame.counter) {
                    self.stats.record_dropped();
                    trace!(counter = frame.counter, "duplicate frame discarded");
                    return None;
                }
                pt
            }
            None => {
                // Racing rotation: frames sealed under the previous epoch
                // may still be in flight for one grace period.
                let Some((prev, _)) = rx.previous.as_mut() else {
                    self.stats.record_decrypt_error();
                    return None;
                };
                let Some(pt) = prev.open(&session_id, frame) else {
                    self.stats.record_decrypt_error();
                    return None;
                };
                if !prev.window.accept(frame.counter) {
                    self.stats.record_dropped();
                    return None;
                }
                pt
            }
        };

        let (&kind_byte, payload) = plaintext.split_first()?;
        let Some(kind) = FrameKind::from_byte(kind_byte) else {
            self.stats.record_decrypt_error();
            return None;
        };
        Some(Opened {
            kind,
            payload: payload.to_vec(),
        })
    }

    /// Whether the send counter has crossed the rotation threshold.
    pub fn needs_rotation(&self) -> bool {
        if !self.policy.enabled {
            return false;
        }
        let tx = self.tx.lock().expect("tx lock poisoned");
        tx.counter > self.policy.threshold
    }

    /// Current send counter; next frame will use this value.
    pub fn tx_counter(&self) -> u64 {
        self.tx.lock().expect("tx lock poisoned").counter
    }

    /// Swap in a new epoch's keys. The send counter restarts for the new
    /// key; the old receive key stays usable for `grace` to absorb frames
    /// already in flight.
    pub fn rotate(&self, keys: &SessionKeys, role: Role, grace: Duration) {
        let tx_cipher = ChaCha20Poly1305::new(Key::from_slice(keys.tx_key.as_ref()));
        let rx_cipher = ChaCha20Poly1305::new(Key::from_slice(keys.rx_key.as_ref()));

        let mut tx = self.tx.lock().expect("tx lock poisoned");
        let mut rx = self.rx.lock().expect("rx lock poisoned");
        tx.cipher = tx_cipher;
        tx.counter = 0;
        let rx_tag = rx.current.tag;
        let old = std::mem::replace(
            &mut rx.current,
            FrameOpener {
                cipher: rx_cipher,
                tag: rx_tag,
                window: ReplayWindow::new(),
            },
        );
        rx.previous = Some((old, Instant::now() + grace));
        self.stats.record_rotation();
    }

    /// Mark the session closed; every later seal/open fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key_pair() -> (SessionKeys, SessionKeys) {
        let negotiated = crate::types::Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        };
        let ikm = [0x42u8; 64];
        let sid = [9u8; 16];
        (
            SessionKeys::derive(sid, &ikm, Role::Initiator, negotiated),
            SessionKeys::derive(sid, &ikm, Role::Responder, negotiated),
        )
    }

    fn pipelines() -> (Pipeline, Pipeline) {
        let (a_keys, b_keys) = key_pair();
        let stats_a = Arc::new(TunnelStats::default());
        let stats_b = Arc::new(TunnelStats::default());
        (
            Pipeline::new(&a_keys, Role::Initiator, RotationPolicy::default(), stats_a),
            Pipeline::new(&b_keys, Role::Responder, RotationPolicy::default(), stats_b),
        )
    }

    #[test]
    fn seal_open_round_trip() {
        let (a, b) = pipelines();
        let frame = a.seal(FrameKind::Data, b"layer two bytes").unwrap();
        assert_eq!(frame.counter, 0);
        let opened = b.open(&frame).unwrap();
        assert_eq!(opened.kind, FrameKind::Data);
        assert_eq!(opened.payload, b"layer two bytes");
    }

    #[test]
    fn counters_are_monotone() {
        let (a, _) = pipelines();
        for expected in 0..10 {
            let frame = a.seal(FrameKind::Data, b"x").unwrap();
            assert_eq!(frame.counter, expected);
        }
        assert_eq!(a.tx_counter(), 10);
    }

    #[test]
    fn tampered_frame_is_silently_dropped() {
        let (a, b) = pipelines();
        let mut frame = a.seal(FrameKind::Data, b"payload").unwrap();
        frame.payload[0] ^= 0x01;
        assert!(b.open(&frame).is_none());
        assert_eq!(
            b.stats.decrypt_errors.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let (a, _) = pipelines();
        let (_, other) = pipelines();
        let frame = a.seal(FrameKind::Data, b"secret").unwrap();
        assert!(other.open(&frame).is_none());
    }

    #[test]
    fn wrong_session_id_is_dropped() {
        let (a, b) = pipelines();
        let mut frame = a.seal(FrameKind::Data, b"payload").unwrap();
        frame.session_id = [0xEE; 16];
        assert!(b.open(&frame).is_none());
        assert_eq!(
            b.stats.decrypt_errors.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn duplicates_are_deduplicated() {
        let (a, b) = pipelines();
        let frame = a.seal(FrameKind::Data, b"once").unwrap();
        assert!(b.open(&frame).is_some());
        assert!(b.open(&frame).is_none());
        assert_eq!(
            b.stats.dropped_frames.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn out_of_order_within_window_is_accepted() {
        let (a, b) = pipelines();
        let f0 = a.seal(FrameKind::Data, b"0").unwrap();
        let f1 = a.seal(FrameKind::Data, b"1").unwrap();
        let f2 = a.seal(FrameKind::Data, b"2").unwrap();
        assert!(b.open(&f2).is_some());
        assert!(b.open(&f0).is_some());
        assert!(b.open(&f1).is_some());
        // replays of any of them are rejected
        assert!(b.open(&f2).is_none());
        assert!(b.open(&f0).is_none());
    }

    #[test]
    fn oversized_data_frame_rejected() {
        let (a, _) = pipelines();
        let oversized = vec![0u8; 1515];
        assert!(matches!(
            a.seal(FrameKind::Data, &oversized),
            Err(TunnelError::MalformedFrame(1515))
        ));
        let max = vec![0u8; 1514];
        assert!(a.seal(FrameKind::Data, &max).is_ok());
    }

    #[test]
    fn rotation_threshold_signals_and_disabled_rotation_terminates() {
        let (a_keys, _) = key_pair();
        let stats = Arc::new(TunnelStats::default());
        let policy = RotationPolicy {
            enabled: true,
            threshold: 2,
        };
        let p = Pipeline::new(&a_keys, Role::Initiator, policy, stats.clone());
        for _ in 0..3 {
            p.seal(FrameKind::Data, b"x").unwrap();
        }
        assert!(p.needs_rotation());

        let disabled = Pipeline::new(
            &a_keys,
            Role::Initiator,
            RotationPolicy {
                enabled: false,
                threshold: 2,
            },
            stats,
        );
        for _ in 0..3 {
            disabled.seal(FrameKind::Data, b"x").unwrap();
        }
        assert!(matches!(
            disabled.seal(FrameKind::Data, b"x"),
            Err(TunnelError::CounterExhausted)
        ));
    }

    #[test]
    fn rotation_swaps_atomically_with_grace() {
        let (a_keys, b_keys) = key_pair();
        let a = Pipeline::new(
            &a_keys,
            Role::Initiator,
            RotationPolicy::default(),
            Arc::new(TunnelStats::default()),
        );
        let b = Pipeline::new(
            &b_keys,
            Role::Responder,
            RotationPolicy::default(),
            Arc::new(TunnelStats::default()),
        );

        let old_epoch_frame = a.seal(FrameKind::Data, b"pre-rotation").unwrap();

        // New epoch material on both ends.
        let negotiated = crate::types::Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        };
        let fresh_ikm = [0x77u8; 64];
        let a2 = SessionKeys::derive([9u8; 16], &fresh_ikm, Role::Initiator, negotiated);
        let b2 = SessionKeys::derive([9u8; 16], &fresh_ikm, Role::Responder, negotiated);
        a.rotate(&a2, Role::Initiator, Duration::from_secs(30));
        b.rotate(&b2, Role::Responder, Duration::from_secs(30));

        // In-flight frame from the old epoch still opens within grace.
        assert!(b.open(&old_epoch_frame).is_some());

        // New epoch restarts the counter and round-trips.
        let new_frame = a.seal(FrameKind::Data, b"post-rotation").unwrap();
        assert_eq!(new_frame.counter, 0);
        assert!(b.open(&new_frame).is_some());
    }

    #[test]
    fn zero_grace_rejects_old_epoch() {
        let (a_keys, b_keys) = key_pair();
        let a = Pipeline::new(
            &a_keys,
            Role::Initiator,
            RotationPolicy::default(),
            Arc::new(TunnelStats::default()),
        );
        let b = Pipeline::new(
            &b_keys,
            Role::Responder,
            RotationPolicy::default(),
            Arc::new(TunnelStats::default()),
        );
        let stale = a.seal(FrameKind::Data, b"stale").unwrap();

        let negotiated = crate::types::Negotiated {
            mtu: 1500,
            heartbeat_interval: Duration::from_secs(30),
            key_rotation_interval: Duration::from_secs(3600),
        };
        let fresh = [0x55u8; 64];
        let b2 = SessionKeys::derive([9u8; 16], &fresh, Role::Responder, negotiated);
        b.rotate(&b2, Role::Responder, Duration::ZERO);
        assert!(b.open(&stale).is_none());
    }

    #[test]
    fn closed_pipeline_refuses_work() {
        let (a, b) = pipelines();
        let frame = a.seal(FrameKind::Data, b"last").unwrap();
        a.close();
        b.close();
        assert!(matches!(
            a.seal(FrameKind::Data, b"x"),
            Err(TunnelError::SessionClosed)
        ));
        assert!(b.open(&frame).is_none());
    }

    #[test]
    fn replay_window_semantics() {
        let mut w = ReplayWindow::new();
        assert!(w.accept(5));
        assert!(!w.accept(5));
        assert!(w.accept(4));
        assert!(w.accept(6));
        assert!(!w.accept(4));
        // far jump ages everything out
        assert!(w.accept(5 + WINDOW_BITS + 10));
        assert!(!w.accept(5));
        // within the new window
        assert!(w.accept(WINDOW_BITS + 14));
    }

    #[test]
    fn replay_window_word_boundary_shifts() {
        let mut w = ReplayWindow::new();
        assert!(w.accept(0));
        assert!(w.accept(63));
        assert!(w.accept(64));
        assert!(w.accept(130));
        assert!(!w.accept(0));
        assert!(!w.accept(63));
        assert!(!w.accept(64));
        assert!(w.accept(1));
    }
}
