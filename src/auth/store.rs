//! Persistent token store.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::auth::types::Credential;
use crate::storage::{KeyValueStorage, StorageResult};

/// Storage key credentials are persisted under.
pub const TOKEN_KEY: &str = "credentials";

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self) -> StorageResult<Option<Credential>>;
    async fn set(&self, credential: &Credential) -> StorageResult<()>;
    async fn clear(&self) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<Option<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self) -> StorageResult<Option<Credential>> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn set(&self, credential: &Credential) -> StorageResult<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Credentials serialized as JSON into a [`KeyValueStorage`].
pub struct StorageTokenStore {
    storage: Arc<dyn KeyValueStorage>,
}

impl StorageTokenStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TokenStore for StorageTokenStore {
    async fn get(&self) -> StorageResult<Option<Credential>> {
        match self.storage.read(TOKEN_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, credential: &Credential) -> StorageResult<()> {
        let bytes = serde_json::to_vec(credential)?;
        self.storage.write(TOKEN_KEY, &bytes).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.storage.remove(TOKEN_KEY).await
    }
}
