//! Lock-free tunnel telemetry
//!
//! Counters are plain relaxed atomics updated from the hot loops; the
//! snapshot is the read-only view handed to external telemetry.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::state::ConnState;
use crate::types::{PeerAddress, SessionId};

/// Per-tunnel counters. All updates are relaxed; these are statistics,
/// not synchronization.
#[derive(Default)]
pub struct TunnelStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub encrypt_errors: AtomicU64,
    pub decrypt_errors: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub migrations_ok: AtomicU64,
    pub migrations_fail: AtomicU64,
    pub fallbacks: AtomicU64,
    current_state: AtomicU8,
    last_rotation_unix: AtomicU64,
}

impl TunnelStats {
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decrypt_error(&self) {
        self.decrypt_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encrypt_error(&self) {
        self.encrypt_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self, ok: bool) {
        if ok {
            self.migrations_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.migrations_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_rotation_unix.store(now, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: ConnState) {
        self.current_state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.current_state.load(Ordering::Relaxed))
    }

    /// Read-only snapshot for external telemetry.
    pub fn snapshot(
        &self,
        session_id: Option<SessionId>,
        peer_address: Option<PeerAddress>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            session_id: session_id.map(hex::encode),
            peer_address,
            frames_in: self.frames_received.load(Ordering::Relaxed),
            frames_out: self.frames_sent.load(Ordering::Relaxed),
            bytes_in: self.bytes_received.load(Ordering::Relaxed),
            bytes_out: self.bytes_sent.load(Ordering::Relaxed),
            encrypt_errors: self.encrypt_errors.load(Ordering::Relaxed),
            decrypt_errors: self.decrypt_errors.load(Ordering::Relaxed),
            dropped: self.dropped_frames.load(Ordering::Relaxed),
            malformed: self.malformed_frames.load(Ordering::Relaxed),
            migrations_ok: self.migrations_ok.load(Ordering::Relaxed),
            migrations_fail: self.migrations_fail.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            last_rotation_at: match self.last_rotation_unix.load(Ordering::Relaxed) {
                0 => None,
                secs => Some(secs),
            },
        }
    }
}

/// Point-in-time view of a tunnel's counters and state.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub state: ConnState,
    pub session_id: Option<String>,
    pub peer_address: Option<PeerAddress>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub encrypt_errors: u64,
    pub decrypt_errors: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub migrations_ok: u64,
    pub migrations_fail: u64,
    pub fallbacks: u64,
    pub last_rotation_at: Option<u64>,
}
