//! Validated configuration consumed by the tunnel core
//!
//! Loading and defaulting live in the configuration layer; the core only
//! accepts structs that pass [`TunnelConfig::validate`]. Anything that
//! fails validation is a fatal pre-start error.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TunnelError};

/// Bounds accepted for the TAP MTU.
pub const MTU_MIN: u16 = 576;
pub const MTU_MAX: u16 = 9000;

/// Minimum accepted key rotation interval.
pub const ROTATION_MIN: Duration = Duration::from_secs(60);

/// Top-level configuration for one tunnel.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub relay: RelayConfig,
    pub tap: TapConfig,
    pub crypto: CryptoConfig,
    pub direct: DirectConfig,
    pub identity: IdentityConfig,
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// `wss://` relay endpoint
    pub url: String,
    /// Optional relay CA certificate (DER); system roots otherwise
    pub ca_der: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct TapConfig {
    /// Requested interface name; on macOS the kernel-assigned name wins
    pub name: String,
    pub mtu: u16,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct CryptoConfig {
    pub enable_key_rotation: bool,
    pub key_rotation_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct DirectConfig {
    /// Whether to run a direct listener and attempt migration at all
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// Directory holding the keystore and client id files (created 0700)
    pub keys_dir: PathBuf,
}

/// Protocol deadlines. Tests shrink these; production keeps the
/// defaults.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub handshake: Duration,
    pub rehandshake: Duration,
    pub direct_dial: Duration,
    pub migration_flush: Duration,
    pub shutdown_drain: Duration,
    pub health_interval: Duration,
    pub direct_retry: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            rehandshake: Duration::from_secs(5),
            direct_dial: Duration::from_millis(500),
            migration_flush: Duration::from_millis(50),
            shutdown_drain: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            direct_retry: Duration::from_secs(60),
        }
    }
}

impl TunnelConfig {
    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.relay.url.starts_with("wss://") || self.relay.url.starts_with("ws://")) {
            return Err(TunnelError::Config(format!(
                "relay url must be a websocket endpoint, got {:?}",
                self.relay.url
            )));
        }
        if !(MTU_MIN..=MTU_MAX).contains(&self.tap.mtu) {
            return Err(TunnelError::Config(format!(
                "tap mtu {} outside {}..={}",
                self.tap.mtu, MTU_MIN, MTU_MAX
            )));
        }
        if self.crypto.enable_key_rotation && self.crypto.key_rotation_interval < ROTATION_MIN {
            return Err(TunnelError::Config(format!(
                "key rotation interval below {}s",
                ROTATION_MIN.as_secs()
            )));
        }
        if self.timeouts.migration_flush > self.timeouts.rehandshake {
            return Err(TunnelError::Config(
                "migration flush bound exceeds rehandshake deadline".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid() -> TunnelConfig {
        TunnelConfig {
            relay: RelayConfig {
                url: "wss://relay.example.net:443/forward".into(),
                ca_der: None,
            },
            tap: TapConfig {
                name: "sm0".into(),
                mtu: 1500,
                ip: Ipv4Addr::new(10, 10, 10, 3),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            },
            crypto: CryptoConfig {
                enable_key_rotation: true,
                key_rotation_interval: Duration::from_secs(3600),
            },
            direct: DirectConfig { enabled: true },
            identity: IdentityConfig {
                keys_dir: PathBuf::from("/var/lib/shadowmesh"),
            },
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_bad_relay_scheme() {
        let mut cfg = valid();
        cfg.relay.url = "https://relay.example.net".into();
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn rejects_mtu_out_of_bounds() {
        let mut cfg = valid();
        cfg.tap.mtu = 575;
        assert!(cfg.validate().is_err());
        cfg.tap.mtu = 9001;
        assert!(cfg.validate().is_err());
        cfg.tap.mtu = 9000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_fast_rotation() {
        let mut cfg = valid();
        cfg.crypto.key_rotation_interval = Duration::from_secs(30);
        assert!(cfg.validate().is_err());
        cfg.crypto.enable_key_rotation = false;
        assert!(cfg.validate().is_ok());
    }
}
