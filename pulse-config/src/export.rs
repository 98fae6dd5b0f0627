use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use pulse_api_types::{NodeConfig, ThresholdConfig};

use crate::SystemConfig;

const BUNDLE_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PBKDF2_ITERATIONS: usize = 100_000;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
/// What a sealed bundle carries. Node ids are regenerated on import, so a
/// bundle can move between installations.
pub struct ExportPayload {
    pub nodes: Vec<NodeConfig>,
    pub system: SystemConfig,
    pub thresholds: ThresholdConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A portable, passphrase-sealed configuration bundle.
///
/// `data` is `salt(16) | nonce(12) | ciphertext | tag(16)`; the key is
/// PBKDF2-HMAC-SHA256 over the passphrase.
pub struct ExportBundle {
    pub version: u32,
    #[serde(with = "proxmox_serde::epoch_as_rfc3339")]
    pub created_at: i64,
    #[serde(with = "proxmox_serde::bytes_as_base64")]
    pub data: Vec<u8>,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], Error> {
    let mut key = [0u8; 32];
    openssl::pkcs5::pbkdf2_hmac(
        passphrase.as_bytes(),
        salt,
        PBKDF2_ITERATIONS,
        openssl::hash::MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}

/// Seal a payload with the user's passphrase.
pub fn seal_bundle(payload: &ExportPayload, passphrase: &str) -> Result<ExportBundle, Error> {
    let plaintext = serde_json::to_vec(payload)?;

    let mut salt = [0u8; SALT_LEN];
    openssl::rand::rand_bytes(&mut salt)?;
    let mut nonce = [0u8; NONCE_LEN];
    openssl::rand::rand_bytes(&mut nonce)?;
    let key = derive_key(passphrase, &salt)?;

    let cipher = openssl::symm::Cipher::aes_256_gcm();
    let mut tag = [0u8; TAG_LEN];
    let ciphertext =
        openssl::symm::encrypt_aead(cipher, &key, Some(&nonce), b"", &plaintext, &mut tag)?;

    let mut data = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len() + TAG_LEN);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);
    data.extend_from_slice(&tag);

    Ok(ExportBundle {
        version: BUNDLE_VERSION,
        created_at: proxmox_time::epoch_i64(),
        data,
    })
}

/// Open a sealed bundle. Rejects unknown versions and any tag mismatch.
pub fn open_bundle(bundle: &ExportBundle, passphrase: &str) -> Result<ExportPayload, Error> {
    if bundle.version != BUNDLE_VERSION {
        bail!("unsupported bundle version {}", bundle.version);
    }
    if bundle.data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        bail!("bundle data too short ({} bytes)", bundle.data.len());
    }

    let salt = &bundle.data[..SALT_LEN];
    let nonce = &bundle.data[SALT_LEN..SALT_LEN + NONCE_LEN];
    let tag = &bundle.data[bundle.data.len() - TAG_LEN..];
    let ciphertext = &bundle.data[SALT_LEN + NONCE_LEN..bundle.data.len() - TAG_LEN];

    let key = derive_key(passphrase, salt)?;
    let cipher = openssl::symm::Cipher::aes_256_gcm();
    let plaintext = openssl::symm::decrypt_aead(cipher, &key, Some(nonce), b"", ciphertext, tag)
        .map_err(|_| format_err!("unable to open bundle (wrong passphrase?)"))?;

    Ok(serde_json::from_slice(&plaintext)?)
}
