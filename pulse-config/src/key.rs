use std::path::Path;

use anyhow::{Context, Error};

use proxmox_sys::fs::file_get_contents;

use crate::{replace_secret_file, CryptoFailure};

/// Load the machine-local encryption key, generating it on first start.
///
/// The key is 32 random bytes stored with mode 0600. A present-but-invalid
/// key file is a [`CryptoFailure`]; regenerating it would orphan the
/// encrypted node store.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], Error> {
    if path.exists() {
        let raw = file_get_contents(path)
            .map_err(|err| CryptoFailure(format!("unable to read {:?} - {}", path, err)))?;
        if raw.len() != 32 {
            return Err(CryptoFailure(format!(
                "encryption key {:?} has wrong size ({} bytes)",
                path,
                raw.len()
            ))
            .into());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        return Ok(key);
    }

    let mut key = [0u8; 32];
    openssl::rand::rand_bytes(&mut key).context("unable to generate encryption key")?;
    replace_secret_file(path, &key)
        .with_context(|| format!("unable to store encryption key {:?}", path))?;
    log::info!("generated new encryption key at {:?}", path);
    Ok(key)
}
