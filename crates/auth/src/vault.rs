//! Credential vault: AES-256-GCM at rest with per-tenant key derivation.
//!
//! Ciphertext frame: `[version:1][nonce:12][ciphertext+tag]`. The version
//! byte selects the root-key epoch, so ciphertexts written before a key
//! rotation stay decryptable while new wraps use the current key.
//!
//! Tenant keys derive from the epoch root key with PBKDF2-SHA256 salted by
//! the tenant id, so a leaked per-tenant key never exposes a sibling
//! tenant. Plaintext never reaches logs or audit paths.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::collections::HashMap;

use voxgate_core::{Error, Result};

const NONCE_SIZE: usize = 12;
const KDF_ROUNDS: u32 = 10_000;

/// Process-wide vault holding the current root key and retained priors.
pub struct CredentialVault {
    current_version: u8,
    root_keys: HashMap<u8, [u8; 32]>,
}

impl CredentialVault {
    /// Vault with a single root key at version 1.
    pub fn new(root_key: [u8; 32]) -> Self {
        Self {
            current_version: 1,
            root_keys: HashMap::from([(1, root_key)]),
        }
    }

    pub fn from_hex(root_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(root_key_hex)
            .map_err(|_| Error::validation("vault_root_key", "must be hex"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::validation("vault_root_key", "must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    /// Rotate to a new root key. Prior keys stay for unwrap only.
    pub fn rotate(&mut self, new_root_key: [u8; 32]) -> u8 {
        let version = self.current_version + 1;
        self.root_keys.insert(version, new_root_key);
        self.current_version = version;
        tracing::info!(version, "vault root key rotated");
        version
    }

    fn tenant_key(&self, version: u8, tenant_id: &str) -> Result<[u8; 32]> {
        let root = self.root_keys.get(&version).ok_or_else(|| {
            Error::Internal(format!("no vault key for ciphertext version {version}"))
        })?;
        let salt = format!("voxgate-vault:{tenant_id}");
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(root, salt.as_bytes(), KDF_ROUNDS, &mut key);
        Ok(key)
    }

    /// Encrypt a credential blob for a tenant.
    pub fn wrap(&self, tenant_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.tenant_key(self.current_version, tenant_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Internal(format!("cipher init failed: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Internal("encryption failed".to_string()))?;

        let mut framed = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        framed.push(self.current_version);
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Decrypt a credential blob written by this or any retained key.
    pub fn unwrap(&self, tenant_id: &str, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 1 + NONCE_SIZE {
            return Err(Error::validation("ciphertext", "too short"));
        }
        let version = framed[0];
        let (nonce_bytes, ciphertext) = framed[1..].split_at(NONCE_SIZE);

        let key = self.tenant_key(version, tenant_id)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Internal(format!("cipher init failed: {e}")))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Unauthenticated("credential decryption failed".to_string()))
    }
}
