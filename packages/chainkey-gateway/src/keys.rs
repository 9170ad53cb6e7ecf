//! Gateway key material on disk.
//!
//! `gateway.key` holds the 32-byte seed as hex. Both the signing and the
//! encryption key are derived from it, so the file is all a gateway needs to
//! keep its identity across restarts.

use std::fs;
use std::path::Path;

use chainkey_core::crypto::{random_bytes, GatewayKeyPair};
use chainkey_core::{Error, Result};
use zeroize::Zeroize;

pub const KEY_FILE: &str = "gateway.key";

/// Load the gateway keypair, creating and persisting a new one if absent.
pub fn load_or_create(dir: &Path) -> Result<GatewayKeyPair> {
    let path = dir.join(KEY_FILE);

    if path.exists() {
        let mut text = fs::read_to_string(&path)
            .map_err(|e| Error::Internal(format!("Failed to read {}: {}", path.display(), e)))?;
        let decoded = hex::decode(text.trim());
        text.zeroize();
        let mut seed_bytes = decoded.map_err(|e| Error::invalid(KEY_FILE, e.to_string()))?;

        let seed: [u8; 32] = match seed_bytes.as_slice().try_into() {
            Ok(seed) => seed,
            Err(_) => {
                seed_bytes.zeroize();
                return Err(Error::invalid(KEY_FILE, "seed must be 32 bytes"));
            }
        };
        seed_bytes.zeroize();

        tracing::info!(path = %path.display(), "Loaded gateway key");
        return GatewayKeyPair::from_seed(&seed);
    }

    fs::create_dir_all(dir)
        .map_err(|e| Error::Internal(format!("Failed to create {}: {}", dir.display(), e)))?;

    let mut seed: [u8; 32] = random_bytes();
    let keys = GatewayKeyPair::from_seed(&seed)?;
    let mut encoded = hex::encode(seed);
    seed.zeroize();

    let written = write_private(&path, &encoded);
    encoded.zeroize();
    written?;

    tracing::info!(path = %path.display(), "Generated new gateway key");
    Ok(keys)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::Internal(format!("Failed to create {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| Error::Internal(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .map_err(|e| Error::Internal(format!("Failed to write {}: {}", path.display(), e)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(KEY_FILE).exists());

        let second = load_or_create(dir.path()).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEY_FILE), "abcd").unwrap();
        assert!(matches!(
            load_or_create(dir.path()),
            Err(Error::InvalidInput { .. })
        ));

        fs::write(dir.path().join(KEY_FILE), "not hex").unwrap();
        assert!(load_or_create(dir.path()).is_err());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("secure_storage");
        load_or_create(&nested).unwrap();
        assert!(nested.join(KEY_FILE).exists());
    }
}
