//! Google Cloud KMS over its v1 REST API.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::KeyManagement;
use crate::api::ApiClient;
use crate::auth::TokenProvider;
use crate::config::DEFAULT_KMS_ENDPOINT;
use crate::error::{Error, Result};
use crate::resource::{CryptoKey, CryptoKeyRef, KeyRing, KeyRingRef};

const SERVICE: &str = "kms";
const PURPOSE_ENCRYPT_DECRYPT: &str = "ENCRYPT_DECRYPT";

#[derive(Serialize)]
struct EncryptRequest {
    plaintext: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
struct DecryptRequest {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    /// Absent when the plaintext was empty.
    #[serde(default)]
    plaintext: String,
}

#[derive(Serialize)]
struct CreateCryptoKeyRequest {
    purpose: &'static str,
}

/// Cloud KMS client.
#[derive(Clone)]
pub struct CloudKms {
    api: ApiClient,
}

impl CloudKms {
    pub fn new(client: Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            api: ApiClient::new(SERVICE, DEFAULT_KMS_ENDPOINT, client, tokens),
        }
    }

    /// Override API base URL (useful for tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = self.api.with_base_url(base_url);
        self
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|err| Error::Decode(format!("KMS returned invalid base64 {field}: {err}")))
}

#[async_trait]
impl KeyManagement for CloudKms {
    async fn encrypt(&self, key: &CryptoKeyRef, plaintext: &[u8]) -> Result<Vec<u8>> {
        let response: EncryptResponse = self
            .api
            .post(
                &format!("/v1/{}:encrypt", key.name()),
                &[],
                &EncryptRequest {
                    plaintext: STANDARD.encode(plaintext),
                },
            )
            .await?;

        decode("ciphertext", &response.ciphertext)
    }

    async fn decrypt(&self, key: &CryptoKeyRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let response: DecryptResponse = self
            .api
            .post(
                &format!("/v1/{}:decrypt", key.name()),
                &[],
                &DecryptRequest {
                    ciphertext: STANDARD.encode(ciphertext),
                },
            )
            .await?;

        decode("plaintext", &response.plaintext)
    }

    async fn create_key_ring(&self, key_ring: &KeyRingRef) -> Result<KeyRing> {
        tracing::info!(key_ring = %key_ring, "Creating key ring");
        self.api
            .post(
                &format!("/v1/{}/keyRings", key_ring.parent()),
                &[("keyRingId", key_ring.key_ring_id.as_str())],
                &serde_json::json!({}),
            )
            .await
    }

    async fn create_crypto_key(&self, key: &CryptoKeyRef) -> Result<CryptoKey> {
        tracing::info!(crypto_key = %key, "Creating crypto key");
        self.api
            .post(
                &format!("/v1/{}/cryptoKeys", key.key_ring.name()),
                &[("cryptoKeyId", key.key_id.as_str())],
                &CreateCryptoKeyRequest {
                    purpose: PURPOSE_ENCRYPT_DECRYPT,
                },
            )
            .await
    }

    fn name(&self) -> &str {
        "cloudkms"
    }
}
