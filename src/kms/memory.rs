//! In-memory KMS for tests and offline use.
//!
//! Ciphertext is bound to the key that produced it: decrypting with any
//! other key, or decrypting tampered bytes, fails like Cloud KMS does.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::KeyManagement;
use crate::error::{Error, Result};
use crate::resource::{CryptoKey, CryptoKeyRef, KeyRing, KeyRingRef};

const MAGIC: &[u8] = b"memkms1:";

#[derive(Default)]
struct State {
    key_rings: HashSet<String>,
    /// Key resource name -> per-key mask byte.
    crypto_keys: HashMap<String, u8>,
}

/// In-memory key management for testing purposes.
#[derive(Default)]
pub struct MemoryKms {
    state: Mutex<State>,
}

impl MemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the ring (if needed) and the key in one step.
    pub async fn with_key(self, key: &CryptoKeyRef) -> Self {
        {
            let mut state = self.state.lock().await;
            state.key_rings.insert(key.key_ring.name());
            let mask = mask_for(state.crypto_keys.len());
            state.crypto_keys.entry(key.name()).or_insert(mask);
        }
        self
    }

    async fn key_mask(&self, key: &CryptoKeyRef) -> Result<u8> {
        let state = self.state.lock().await;
        state
            .crypto_keys
            .get(&key.name())
            .copied()
            .ok_or_else(|| Error::NotFound(format!("CryptoKey {key} not found.")))
    }
}

fn mask_for(index: usize) -> u8 {
    0x5a_u8.wrapping_add((index as u8).wrapping_mul(31))
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.rotate_left(3) ^ b)
}

#[async_trait]
impl KeyManagement for MemoryKms {
    async fn encrypt(&self, key: &CryptoKeyRef, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mask = self.key_mask(key).await?;
        let name = key.name();

        let mut out = Vec::with_capacity(MAGIC.len() + 2 + name.len() + plaintext.len() + 1);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend(plaintext.iter().map(|b| b ^ mask));
        out.push(checksum(plaintext));
        Ok(out)
    }

    async fn decrypt(&self, key: &CryptoKeyRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mask = self.key_mask(key).await?;
        let invalid = || Error::service("kms", "INVALID_ARGUMENT (400): Decryption failed: the ciphertext is invalid.");

        let rest = ciphertext.strip_prefix(MAGIC).ok_or_else(invalid)?;
        if rest.len() < 2 {
            return Err(invalid());
        }
        let name_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2..];
        if rest.len() < name_len + 1 {
            return Err(invalid());
        }
        let (name, body) = rest.split_at(name_len);
        if name != key.name().as_bytes() {
            return Err(invalid());
        }

        let (masked, check) = body.split_at(body.len() - 1);
        let plaintext: Vec<u8> = masked.iter().map(|b| b ^ mask).collect();
        if checksum(&plaintext) != check[0] {
            return Err(invalid());
        }
        Ok(plaintext)
    }

    async fn create_key_ring(&self, key_ring: &KeyRingRef) -> Result<KeyRing> {
        let mut state = self.state.lock().await;
        let name = key_ring.name();
        if !state.key_rings.insert(name.clone()) {
            return Err(Error::AlreadyExists(format!("KeyRing {name} already exists.")));
        }
        Ok(KeyRing {
            name,
            create_time: Some(chrono::Utc::now()),
        })
    }

    async fn create_crypto_key(&self, key: &CryptoKeyRef) -> Result<CryptoKey> {
        let mut state = self.state.lock().await;
        if !state.key_rings.contains(&key.key_ring.name()) {
            return Err(Error::NotFound(format!("KeyRing {} not found.", key.key_ring)));
        }
        let name = key.name();
        if state.crypto_keys.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("CryptoKey {name} already exists.")));
        }
        let mask = mask_for(state.crypto_keys.len());
        state.crypto_keys.insert(name.clone(), mask);
        Ok(CryptoKey {
            name,
            purpose: Some("ENCRYPT_DECRYPT".to_string()),
            create_time: Some(chrono::Utc::now()),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
