//! Encrypt-then-store orchestration over a [`KeyManagement`] and a [`KeyStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::keystore::{validate_name, KeyStore};
use crate::kms::KeyManagement;
use crate::resource::{CryptoKey, CryptoKeyRef, KeyRing, KeyRingRef};

/// Outcome of decrypting every record of a kind.
#[derive(Default)]
pub struct GetAllReport {
    /// Successfully decrypted credentials, by name.
    pub secrets: BTreeMap<String, SecretString>,
    /// Records that could not be decrypted, by name.
    pub failures: BTreeMap<String, Error>,
}

impl GetAllReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The credential store: plaintext in, ciphertext persisted.
pub struct Credstash {
    kms: Arc<dyn KeyManagement>,
    store: Arc<dyn KeyStore>,
}

impl Credstash {
    pub fn new(kms: Arc<dyn KeyManagement>, store: Arc<dyn KeyStore>) -> Self {
        tracing::debug!(kms = kms.name(), store = store.name(), "Credential store ready");
        Self { kms, store }
    }

    /// Encrypt `plaintext` with `key` and upsert it as `name`.
    pub async fn put(
        &self,
        key: &CryptoKeyRef,
        kind: &str,
        name: &str,
        plaintext: &SecretString,
    ) -> Result<()> {
        validate_name(name)?;

        let ciphertext = self
            .kms
            .encrypt(key, plaintext.expose_secret().as_bytes())
            .await?;
        self.store.put(kind, name, &ciphertext).await?;

        tracing::info!(
            name,
            kind,
            crypto_key = %key,
            kms = self.kms.name(),
            store = self.store.name(),
            "Stored credential"
        );
        Ok(())
    }

    /// Fetch `name` and decrypt it with `key`.
    pub async fn get(&self, key: &CryptoKeyRef, kind: &str, name: &str) -> Result<SecretString> {
        let ciphertext = self.store.get(kind, name).await?;
        self.decrypt(key, &ciphertext).await
    }

    /// Fetch and decrypt every record of `kind`.
    ///
    /// A record that cannot be read or decrypted is reported in `failures`;
    /// the others are still returned.
    pub async fn get_all(&self, key: &CryptoKeyRef, kind: &str) -> Result<GetAllReport> {
        let records = self.store.get_all(kind).await?;
        let mut report = GetAllReport::default();

        for (name, ciphertext) in records {
            let plaintext = match ciphertext {
                Ok(ciphertext) => self.decrypt(key, &ciphertext).await,
                Err(err) => Err(err),
            };
            match plaintext {
                Ok(plaintext) => {
                    report.secrets.insert(name, plaintext);
                }
                Err(err) => {
                    tracing::debug!(name = %name, error = %err, "Unreadable credential");
                    report.failures.insert(name, err);
                }
            }
        }

        Ok(report)
    }

    /// Names of every record of `kind`, without decrypting.
    ///
    /// Records with unreadable ciphertext are listed too.
    pub async fn list(&self, kind: &str) -> Result<Vec<String>> {
        Ok(self.store.get_all(kind).await?.into_keys().collect())
    }

    pub async fn create_key_ring(&self, key_ring: &KeyRingRef) -> Result<KeyRing> {
        self.kms.create_key_ring(key_ring).await
    }

    pub async fn create_key(&self, key_ring: &KeyRingRef, key_id: &str) -> Result<CryptoKey> {
        self.kms.create_crypto_key(&key_ring.crypto_key(key_id)).await
    }

    async fn decrypt(&self, key: &CryptoKeyRef, ciphertext: &[u8]) -> Result<SecretString> {
        let plaintext = self.kms.decrypt(key, ciphertext).await?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::Decode("decrypted credential is not valid UTF-8".to_string()))?;
        Ok(SecretString::new(plaintext.into()))
    }
}
