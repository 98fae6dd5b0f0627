//! Persisted state of the pulse daemon.
//!
//! Everything lives under one data directory: the machine-local encryption
//! key, the AES-GCM encrypted node list, and a handful of plain JSON
//! documents. All writes go through atomic replace (tmp file, fsync,
//! rename); a store that fails to load refuses to start the daemon instead
//! of silently resetting configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;

use proxmox_sys::fs::{create_path, file_get_contents, replace_file, CreateOptions};

mod export;
mod key;
mod nodes;
mod system;
mod thresholds;

pub use export::{open_bundle, seal_bundle, ExportBundle, ExportPayload};
pub use key::load_or_create_key;
pub use nodes::NodeStore;
pub use system::SystemConfig;
pub use thresholds::ThresholdStore;

/// Error marker for failures that must terminate startup with the
/// encryption-key exit code instead of the generic config one.
#[derive(Debug)]
pub struct CryptoFailure(pub String);

impl std::fmt::Display for CryptoFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CryptoFailure {}

/// The daemon's data directory and the well-known files inside it.
#[derive(Clone, Debug)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, Error> {
        let base = base.as_ref().to_path_buf();
        create_path(&base, None, Some(CreateOptions::new()))
            .map_err(|err| format_err!("unable to create data dir {:?} - {}", base, err))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn encryption_key_path(&self) -> PathBuf {
        self.base.join(".encryption.key")
    }

    pub fn nodes_path(&self) -> PathBuf {
        self.base.join("nodes.enc")
    }

    pub fn system_path(&self) -> PathBuf {
        self.base.join("system.json")
    }

    pub fn thresholds_path(&self) -> PathBuf {
        self.base.join("thresholds.json")
    }

    pub fn overrides_path(&self) -> PathBuf {
        self.base.join("overrides.json")
    }

    /// Opaque notifier configuration blobs (`webhooks.json`, `email.json`);
    /// stored and returned verbatim for the out-of-scope notifier
    /// implementations.
    pub fn notifier_blob_path(&self, name: &str) -> Option<PathBuf> {
        match name {
            "webhooks" | "email" => Some(self.base.join(format!("{}.json", name))),
            _ => None,
        }
    }
}

/// Atomically write a secret file: 0600, fsynced, renamed into place.
pub(crate) fn replace_secret_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o0600);
    replace_file(path, data, CreateOptions::new().perm(mode), true)?;
    Ok(())
}

/// Atomically write a plain config file (0644).
pub(crate) fn replace_config_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o0644);
    replace_file(path, data, CreateOptions::new().perm(mode), true)?;
    Ok(())
}

/// Read a JSON document, or `None` when the file does not exist yet.
pub(crate) fn file_get_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = file_get_contents(path)?;
    let parsed = serde_json::from_slice(&raw)
        .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;
    Ok(Some(parsed))
}

pub(crate) fn store_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let data = serde_json::to_vec_pretty(value)?;
    replace_config_file(path, &data)
        .with_context(|| format!("unable to store {:?}", path))
}

/// Read an opaque notifier blob.
pub fn read_notifier_blob(dir: &DataDir, name: &str) -> Result<Option<serde_json::Value>, Error> {
    match dir.notifier_blob_path(name) {
        Some(path) => file_get_json_opt(&path),
        None => bail!("unknown notifier config '{}'", name),
    }
}

/// Store an opaque notifier blob verbatim.
pub fn write_notifier_blob(
    dir: &DataDir,
    name: &str,
    value: &serde_json::Value,
) -> Result<(), Error> {
    match dir.notifier_blob_path(name) {
        Some(path) => store_json(&path, value),
        None => bail!("unknown notifier config '{}'", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> DataDir {
        let base = std::env::temp_dir().join(format!(
            "pulse-config-test-{}-{}",
            std::process::id(),
            proxmox_time::epoch_f64().to_bits()
        ));
        DataDir::new(base).unwrap()
    }

    #[test]
    fn notifier_blobs_round_trip_verbatim() -> Result<(), Error> {
        let dir = scratch_dir();
        assert!(read_notifier_blob(&dir, "webhooks")?.is_none());

        let blob = serde_json::json!({ "url": "https://hooks.example/x", "enabled": true });
        write_notifier_blob(&dir, "webhooks", &blob)?;
        assert_eq!(read_notifier_blob(&dir, "webhooks")?, Some(blob));

        assert!(read_notifier_blob(&dir, "../etc/passwd").is_err());
        assert!(write_notifier_blob(&dir, "other", &serde_json::json!({})).is_err());
        Ok(())
    }
}
