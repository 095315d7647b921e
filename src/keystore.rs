//! Signing keys
//!
//! The transaction manager only ever sees public key ids and signatures.

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Keystore: Send + Sync {
    /// 64-byte Ed25519 signature of `digest` by the key with hex public key `key_id`
    async fn sign(&self, key_id: &str, digest: &[u8]) -> TxmResult<Vec<u8>>;

    async fn accounts(&self) -> TxmResult<Vec<String>>;
}

/// Ed25519 keys held in process memory
#[derive(Default)]
pub struct InMemoryKeystore {
    keys: DashMap<String, SigningKey>,
}

impl InMemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key from its 32-byte seed; returns the key id
    pub fn add_seed(&self, seed: [u8; 32]) -> String {
        let key = SigningKey::from_bytes(&seed);
        let id = hex::encode(key.verifying_key().to_bytes());
        debug!("Keystore loaded key {}", id);
        self.keys.insert(id.clone(), key);
        id
    }

    pub fn add_seed_hex(&self, seed: &str) -> TxmResult<String> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| TxmError::Keystore(format!("bad seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TxmError::Keystore("seed must be 32 bytes".into()))?;
        Ok(self.add_seed(seed))
    }
}

#[async_trait]
impl Keystore for InMemoryKeystore {
    async fn sign(&self, key_id: &str, digest: &[u8]) -> TxmResult<Vec<u8>> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| TxmError::Keystore(format!("unknown key {}", key_id)))?;
        Ok(key.sign(digest).to_bytes().to_vec())
    }

    async fn accounts(&self) -> TxmResult<Vec<String>> {
        let mut ids: Vec<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Public key bytes of a key id
pub fn public_key_bytes(key_id: &str) -> TxmResult<[u8; 32]> {
    hex::decode(key_id)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TxmError::Keystore(format!("malformed key id {}", key_id)))
}
