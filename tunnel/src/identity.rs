//! Persisted client identity
//!
//! The hybrid signing key lives in a versioned keystore file (0600)
//! inside a private directory (0700); the hex client id sits beside it.
//! Reusing the key across runs is what keeps the client id stable, so a
//! missing or unreadable keystore generates once and persists, never per
//! boot.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crypto::keys::{signing_key_from_bytes, signing_key_to_bytes};
use crypto::{HybridSigningKey, PeerId};

use crate::error::{Result, TunnelError};

const SIGNING_KEY_FILE: &str = "signing_key";
const CLIENT_ID_FILE: &str = "client_id";

/// Load the identity from `keys_dir`, generating and persisting one on
/// first run.
pub fn load_or_create(keys_dir: &Path) -> Result<Arc<HybridSigningKey>> {
    fs::create_dir_all(keys_dir)
        .map_err(|e| TunnelError::Config(format!("cannot create {keys_dir:?}: {e}")))?;
    fs::set_permissions(keys_dir, fs::Permissions::from_mode(0o700))
        .map_err(|e| TunnelError::Config(format!("cannot restrict {keys_dir:?}: {e}")))?;

    let key_path = keys_dir.join(SIGNING_KEY_FILE);
    let key = if key_path.exists() {
        let blob = fs::read(&key_path)
            .map_err(|e| TunnelError::Config(format!("cannot read keystore: {e}")))?;
        let key = signing_key_from_bytes(&blob)?;
        info!(client_id = %hex::encode(key.peer_id()), "loaded persisted identity");
        key
    } else {
        let key = HybridSigningKey::generate();
        let blob = signing_key_to_bytes(&key);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&key_path)
            .map_err(|e| TunnelError::Config(format!("cannot create keystore: {e}")))?;
        file.write_all(&blob)
            .map_err(|e| TunnelError::Config(format!("cannot write keystore: {e}")))?;
        info!(client_id = %hex::encode(key.peer_id()), "generated new identity");
        key
    };

    write_client_id(keys_dir, key.peer_id())?;
    Ok(Arc::new(key))
}

/// Keep the published client id in sync with the key material.
fn write_client_id(keys_dir: &Path, peer_id: PeerId) -> Result<()> {
    let id_path = keys_dir.join(CLIENT_ID_FILE);
    let encoded = hex::encode(peer_id);
    match fs::read_to_string(&id_path) {
        Ok(existing) if existing.trim() == encoded => return Ok(()),
        Ok(_) => warn!("client id file out of sync with keystore, rewriting"),
        Err(_) => {}
    }
    fs::write(&id_path, format!("{encoded}\n"))
        .map_err(|e| TunnelError::Config(format!("cannot write client id: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        use rand::Rng;
        let mut path = std::env::temp_dir();
        path.push(format!(
            "sm_identity_{tag}_{}",
            rand::thread_rng().gen::<u64>()
        ));
        path
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = temp_dir("stable");
        let first = load_or_create(&dir).unwrap();
        let second = load_or_create(&dir).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn key_file_permissions_are_private() {
        let dir = temp_dir("perms");
        let _ = load_or_create(&dir).unwrap();
        let mode = fs::metadata(dir.join(SIGNING_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn client_id_file_matches_key() {
        let dir = temp_dir("id");
        let key = load_or_create(&dir).unwrap();
        let written = fs::read_to_string(dir.join(CLIENT_ID_FILE)).unwrap();
        assert_eq!(written.trim(), hex::encode(key.peer_id()));

        // A corrupted id file is repaired on the next load.
        fs::write(dir.join(CLIENT_ID_FILE), "bogus\n").unwrap();
        let _ = load_or_create(&dir).unwrap();
        let repaired = fs::read_to_string(dir.join(CLIENT_ID_FILE)).unwrap();
        assert_eq!(repaired.trim(), hex::encode(key.peer_id()));
        fs::remove_dir_all(&dir).unwrap();
    }
}
