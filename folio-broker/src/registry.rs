//! Process-wide map from document key to running broker.
//!
//! The registry is the entry point into the per-document core: a new
//! connection asks it for the broker of its document, which is created (and
//! spawned) on first use. A broker removes itself from the map when its task
//! ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use crate::broker::{BrokerConfig, BrokerHandle, DocumentBroker};
use crate::engine::{EngineError, EngineProvider};
use crate::storage::{canonical_uri, Storage};

/// Stable identity of a document: its URI without query and fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(String);

impl DocKey {
    pub fn from_uri(uri: &Url) -> Self {
        Self(canonical_uri(uri).to_string())
    }

    pub fn parse(uri: &str) -> Result<Self, url::ParseError> {
        Url::parse(uri).map(|u| Self::from_uri(&u))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The document's broker is shutting down; retry shortly
    #[error("document {0} is being unloaded")]
    DocumentUnloading(DocKey),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// All open documents.
pub struct DocumentRegistry {
    brokers: Arc<RwLock<HashMap<DocKey, BrokerHandle>>>,
    storage: Arc<dyn Storage>,
    engines: Arc<dyn EngineProvider>,
    config: BrokerConfig,
}

impl DocumentRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        engines: Arc<dyn EngineProvider>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            brokers: Arc::new(RwLock::new(HashMap::new())),
            storage,
            engines,
            config,
        }
    }

    /// The broker for `uri`, creating it if needed.
    ///
    /// Fails with [`RegistryError::DocumentUnloading`] while the existing
    /// broker for this document is being torn down.
    pub async fn find_or_create(&self, uri: &Url) -> Result<BrokerHandle, RegistryError> {
        let key = DocKey::from_uri(uri);

        // Fast path: read lock
        {
            let brokers = self.brokers.read().await;
            if let Some(handle) = brokers.get(&key) {
                if handle.is_marked_for_destruction() {
                    return Err(RegistryError::DocumentUnloading(key));
                }
                if handle.is_alive() {
                    return Ok(handle.clone());
                }
            }
        }

        // Slow path: write lock to create
        let mut brokers = self.brokers.write().await;
        // Double-check after acquiring write lock
        if let Some(handle) = brokers.get(&key) {
            if handle.is_marked_for_destruction() {
                return Err(RegistryError::DocumentUnloading(key));
            }
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            brokers.remove(&key);
        }

        let (broker, handle) = DocumentBroker::new(
            uri,
            self.config.clone(),
            self.storage.clone(),
            self.engines.as_ref(),
        )?;
        brokers.insert(key.clone(), handle.clone());
        log::info!("Created broker {} for {}", handle.id(), key);

        let registry = self.brokers.clone();
        let id = handle.id();
        tokio::spawn(async move {
            broker.run().await;
            let mut brokers = registry.write().await;
            if brokers.get(&key).is_some_and(|h| h.id() == id) {
                brokers.remove(&key);
                log::debug!("Removed broker {id} for {key}");
            }
        });
        Ok(handle)
    }

    pub async fn find(&self, key: &DocKey) -> Option<BrokerHandle> {
        self.brokers.read().await.get(key).cloned()
    }

    pub async fn document_count(&self) -> usize {
        self.brokers.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocKey> {
        self.brokers.read().await.keys().cloned().collect()
    }

    /// Force-save every open document, waiting up to `wait` for each.
    /// Returns how many were stored.
    pub async fn auto_save_all(&self, wait: Duration) -> usize {
        let handles: Vec<BrokerHandle> = self.brokers.read().await.values().cloned().collect();
        let results = futures_util::future::join_all(
            handles.iter().map(|handle| handle.auto_save(true, wait)),
        )
        .await;
        results.into_iter().filter(|saved| *saved).count()
    }

    /// Stop every broker without saving.
    pub async fn stop_all(&self) {
        for handle in self.brokers.read().await.values() {
            handle.stop();
        }
    }
}
