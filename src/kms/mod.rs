//! Key management: encrypt/decrypt with a CryptoKey and create key resources.

mod cloud;
mod memory;

pub use cloud::CloudKms;
pub use memory::MemoryKms;

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::{CryptoKey, CryptoKeyRef, KeyRing, KeyRingRef};

#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Encrypt `plaintext` with the primary version of `key`.
    async fn encrypt(&self, key: &CryptoKeyRef, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt ciphertext produced by [`KeyManagement::encrypt`] with the same key.
    ///
    /// Corrupt or foreign ciphertext fails with a service error.
    async fn decrypt(&self, key: &CryptoKeyRef, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Create a KeyRing. Fails with `AlreadyExists` when the id is taken.
    async fn create_key_ring(&self, key_ring: &KeyRingRef) -> Result<KeyRing>;

    /// Create an `ENCRYPT_DECRYPT` CryptoKey inside an existing ring.
    async fn create_crypto_key(&self, key: &CryptoKeyRef) -> Result<CryptoKey>;

    fn name(&self) -> &str;
}
