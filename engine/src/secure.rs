//! Secure store collaborator for sensitive values.
//!
//! Boxes are plaintext on disk; tokens and other secrets go through this
//! trait instead, backed by the platform keychain or equivalent. The engine
//! never encrypts on its own.

use crate::error::Result;
use dashmap::DashMap;

/// Storage for sensitive values only.
pub trait SecureStore: Send + Sync {
    /// Store bytes under a key, replacing any existing value.
    fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read the bytes under a key, `None` if absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// In-memory secure store for tests and non-sensitive deployments.
#[derive(Debug, Default)]
pub struct MemorySecureStore {
    values: DashMap<String, Vec<u8>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemorySecureStore {
    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_read() {
        let store = MemorySecureStore::new();
        store.store("refresh_token", b"secret").unwrap();

        assert_eq!(store.read("refresh_token").unwrap(), Some(b"secret".to_vec()));
        assert_eq!(store.read("missing").unwrap(), None);

        store.store("refresh_token", b"rotated").unwrap();
        assert_eq!(store.read("refresh_token").unwrap(), Some(b"rotated".to_vec()));
    }
}
