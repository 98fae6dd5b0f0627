use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};

use pulse_api_types::NodeConfig;

use crate::{replace_secret_file, CryptoFailure};

/// Blob layout version; bumped on incompatible changes.
const STORE_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The encrypted node list: `version(1) | nonce(12) | ciphertext | tag(16)`,
/// AES-256-GCM under the machine-local key.
pub struct NodeStore {
    path: PathBuf,
    key: [u8; 32],
    nodes: Vec<NodeConfig>,
}

pub(crate) fn encrypt_blob(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = openssl::symm::Cipher::aes_256_gcm();
    let mut nonce = [0u8; NONCE_LEN];
    openssl::rand::rand_bytes(&mut nonce)?;
    let mut tag = [0u8; TAG_LEN];
    let ciphertext =
        openssl::symm::encrypt_aead(cipher, key, Some(&nonce), b"", plaintext, &mut tag)?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len() + TAG_LEN);
    blob.push(STORE_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    blob.extend_from_slice(&tag);
    Ok(blob)
}

pub(crate) fn decrypt_blob(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, Error> {
    if blob.len() < 1 + NONCE_LEN + TAG_LEN {
        bail!("encrypted blob too short ({} bytes)", blob.len());
    }
    if blob[0] != STORE_VERSION {
        bail!("unsupported blob version {}", blob[0]);
    }
    let nonce = &blob[1..1 + NONCE_LEN];
    let tag = &blob[blob.len() - TAG_LEN..];
    let ciphertext = &blob[1 + NONCE_LEN..blob.len() - TAG_LEN];

    let cipher = openssl::symm::Cipher::aes_256_gcm();
    openssl::symm::decrypt_aead(cipher, key, Some(nonce), b"", ciphertext, tag)
        .map_err(|_| format_err!("decryption failed (wrong key or corrupt blob)"))
}

impl NodeStore {
    /// Load the store, or start empty when the file does not exist yet.
    ///
    /// A present-but-undecryptable file is a [`CryptoFailure`]; the caller
    /// must refuse to start rather than zero out configuration.
    pub fn load(path: &Path, key: [u8; 32]) -> Result<Self, Error> {
        let nodes = if path.exists() {
            let blob = proxmox_sys::fs::file_get_contents(path)?;
            let plaintext = decrypt_blob(&key, &blob).map_err(|err| {
                Error::from(CryptoFailure(format!(
                    "unable to decrypt {:?} (key fingerprint {}) - {}",
                    path,
                    key_fingerprint(&key),
                    err
                )))
            })?;
            serde_json::from_slice(&plaintext)
                .map_err(|err| format_err!("corrupt node list in {:?} - {}", path, err))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            key,
            nodes,
        })
    }

    /// Encrypt and atomically replace the on-disk blob.
    pub fn save(&self) -> Result<(), Error> {
        let plaintext = serde_json::to_vec(&self.nodes)?;
        let blob = encrypt_blob(&self.key, &plaintext)?;
        replace_secret_file(&self.path, &blob)
            .with_context(|| format!("unable to store node list {:?}", self.path))
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn add(&mut self, node: NodeConfig) -> Result<(), Error> {
        if self.get(&node.id).is_some() {
            bail!("node '{}' already exists", node.id);
        }
        self.nodes.push(node);
        self.save()
    }

    /// Replace a node. An update without secrets keeps the stored ones so
    /// the REST layer never has to round-trip credentials.
    pub fn update(&mut self, mut node: NodeConfig) -> Result<(), Error> {
        let current = self
            .nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .ok_or_else(|| format_err!("no such node '{}'", node.id))?;
        if node.password.is_none() {
            node.password = current.password.take();
        }
        if node.token_secret.is_none() {
            node.token_secret = current.token_secret.take();
        }
        *current = node;
        self.save()
    }

    pub fn remove(&mut self, id: &str) -> Result<NodeConfig, Error> {
        let position = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| format_err!("no such node '{}'", id))?;
        let removed = self.nodes.remove(position);
        self.save()?;
        Ok(removed)
    }

    /// Replace the whole set (config import).
    pub fn replace_all(&mut self, nodes: Vec<NodeConfig>) -> Result<(), Error> {
        self.nodes = nodes;
        self.save()
    }
}

fn key_fingerprint(key: &[u8; 32]) -> String {
    // first bytes only, enough to tell two keys apart in a log line
    hex::encode(&key[..4])
}
