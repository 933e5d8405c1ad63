mod datastore;
mod memory;

pub use datastore::DatastoreKeyStore;
pub use memory::MemoryKeyStore;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Ciphertext per record name; unreadable records carry their error.
pub type Records = BTreeMap<String, Result<Vec<u8>>>;

/// Persists `{name, ciphertext}` records grouped by kind.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert or overwrite the record `name` in `kind`.
    async fn put(&self, kind: &str, name: &str, ciphertext: &[u8]) -> Result<()>;

    /// Fetch one record; `Error::NotFound` when absent.
    async fn get(&self, kind: &str, name: &str) -> Result<Vec<u8>>;

    /// Every record of `kind`, ordered by name.
    ///
    /// A record whose ciphertext cannot be read is kept with its error, so
    /// callers see every stored name.
    async fn get_all(&self, kind: &str) -> Result<Records>;

    fn name(&self) -> &str;
}

/// Reject names the store cannot key on.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}
