pub mod cloudflare;
pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{Config, StoreBackend};

pub use cloudflare::CloudflareKv;
pub use memory::MemoryStore;

/// Minimal key-value contract shared by every persistence backend.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`; entries with a TTL vanish once it elapses.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys in lexicographic order, optionally restricted to a prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    fn backend_name(&self) -> &'static str;
}

impl dyn KvStore {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("decoding JSON stored under {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value).context("encoding JSON value")?;
        self.put(key, &raw, ttl).await
    }
}

/// The four namespaces the board persists into.
#[derive(Clone)]
pub struct Stores {
    pub advices: Arc<dyn KvStore>,
    pub bulletins: Arc<dyn KvStore>,
    pub sessions: Arc<dyn KvStore>,
    pub admin_config: Arc<dyn KvStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            advices: Arc::new(MemoryStore::new()),
            bulletins: Arc::new(MemoryStore::new()),
            sessions: Arc::new(MemoryStore::new()),
            admin_config: Arc::new(MemoryStore::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.store {
            StoreBackend::Memory => {
                info!("using in-memory key-value store");
                Ok(Self::in_memory())
            }
            StoreBackend::Cloudflare(cf) => {
                info!(account_id = %cf.account_id, "using Cloudflare Workers KV");
                let client = cloudflare::http_client()?;
                let ns = |id: &str| -> Arc<dyn KvStore> {
                    Arc::new(CloudflareKv::with_client(
                        client.clone(),
                        &cf.api_base,
                        &cf.account_id,
                        id,
                        &cf.api_token,
                    ))
                };
                Ok(Self {
                    advices: ns(&cf.namespaces.advices),
                    bulletins: ns(&cf.namespaces.bulletins),
                    sessions: ns(&cf.namespaces.sessions),
                    admin_config: ns(&cf.namespaces.admin_config),
                })
            }
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("backend", &self.advices.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Note {
        title: String,
        pinned: bool,
    }

    #[tokio::test]
    async fn json_helpers_store_and_load() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let note = Note { title: "water outage".into(), pinned: true };
        store.put_json("note-1", &note, None).await.unwrap();

        let loaded: Option<Note> = store.get_json("note-1").await.unwrap();
        assert_eq!(loaded, Some(note));

        let missing: Option<Note> = store.get_json("note-2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn get_json_reports_garbage() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.put("broken", "{not json", None).await.unwrap();
        let result: Result<Option<Note>> = store.get_json("broken").await;
        assert!(result.is_err());
    }
}
