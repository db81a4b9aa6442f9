//! Connection state machine
//!
//! Only `RelayEstablished` and `DirectEstablished` carry live user
//! frames; `Migrating` and `Degraded` are transient and keep frames
//! flowing through whichever transport is currently bound.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use crate::error::{Result, TunnelError};
use crate::telemetry::TunnelStats;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnState {
    Disconnected,
    Connecting,
    RelayEstablished,
    Migrating,
    DirectEstablished,
    Degraded,
    Reconnecting,
    Closed,
}

impl ConnState {
    /// Whether moving to `next` is an allowed edge of the machine.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, RelayEstablished)
                | (Connecting, Disconnected)
                | (RelayEstablished, Migrating)
                | (RelayEstablished, Reconnecting)
                | (RelayEstablished, Closed)
                | (Migrating, DirectEstablished)
                | (Migrating, RelayEstablished)
                | (Migrating, Reconnecting)
                | (DirectEstablished, Degraded)
                | (DirectEstablished, Reconnecting)
                | (DirectEstablished, Closed)
                | (Degraded, RelayEstablished)
                | (Degraded, Closed)
                | (Reconnecting, Connecting)
                | (Reconnecting, Closed)
        )
    }

    /// Whether user frames are carried in this state. Transient states
    /// keep the bound transport flowing.
    pub fn carries_frames(self) -> bool {
        matches!(
            self,
            ConnState::RelayEstablished
                | ConnState::DirectEstablished
                | ConnState::Migrating
                | ConnState::Degraded
        )
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnState::Disconnected => 0,
            ConnState::Connecting => 1,
            ConnState::RelayEstablished => 2,
            ConnState::Migrating => 3,
            ConnState::DirectEstablished => 4,
            ConnState::Degraded => 5,
            ConnState::Reconnecting => 6,
            ConnState::Closed => 7,
        }
    }

    pub fn from_u8(value: u8) -> ConnState {
        match value {
            1 => ConnState::Connecting,
            2 => ConnState::RelayEstablished,
            3 => ConnState::Migrating,
            4 => ConnState::DirectEstablished,
            5 => ConnState::Degraded,
            6 => ConnState::Reconnecting,
            7 => ConnState::Closed,
            _ => ConnState::Disconnected,
        }
    }
}

/// Shared, transition-validated connection state.
///
/// The mutex guards the transition check; the current value is mirrored
/// into the stats atomics so telemetry reads never take the lock.
pub struct StateMachine {
    current: Mutex<ConnState>,
    stats: Arc<TunnelStats>,
}

impl StateMachine {
    pub fn new(stats: Arc<TunnelStats>) -> Self {
        stats.set_state(ConnState::Disconnected);
        Self {
            current: Mutex::new(ConnState::Disconnected),
            stats,
        }
    }

    pub fn current(&self) -> ConnState {
        *self.current.lock().expect("state lock poisoned")
    }

    /// Move to `next`, rejecting edges the machine does not define.
    pub fn transition(&self, next: ConnState) -> Result<()> {
        let mut current = self.current.lock().expect("state lock poisoned");
        if !current.can_transition_to(next) {
            return Err(TunnelError::InvalidTransition {
                from: *current,
                to: next,
            });
        }
        info!(from = ?*current, to = ?next, "connection state changed");
        *current = next;
        self.stats.set_state(next);
        Ok(())
    }

    /// Transition that tolerates already being in `next`.
    pub fn transition_or_stay(&self, next: ConnState) -> Result<()> {
        if self.current() == next {
            return Ok(());
        }
        self.transition(next)
    }
}
