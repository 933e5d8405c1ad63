//! In-memory key store implementation for testing.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{validate_name, KeyStore, Records};
use crate::error::{Error, Result};

/// In-memory key store for testing purposes.
#[derive(Default)]
pub struct MemoryKeyStore {
    kinds: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put(&self, kind: &str, name: &str, ciphertext: &[u8]) -> Result<()> {
        validate_name(name)?;
        let mut kinds = self.kinds.lock().await;
        kinds
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), ciphertext.to_vec());
        Ok(())
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let kinds = self.kinds.lock().await;
        kinds
            .get(kind)
            .and_then(|records| records.get(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("credential {name:?} in kind {kind:?}")))
    }

    async fn get_all(&self, kind: &str) -> Result<Records> {
        let kinds = self.kinds.lock().await;
        Ok(kinds
            .get(kind)
            .map(|records| {
                records
                    .iter()
                    .map(|(name, ciphertext)| (name.clone(), Ok(ciphertext.clone())))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
