//! In-process storage for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use url::Url;

use super::{canonical_uri, filename_of, Credentials, FileInfo, SaveResult, Storage, StorageError};

/// One recorded save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRecord {
    pub uri: String,
    pub is_autosave: bool,
}

#[derive(Debug)]
struct MemoryState {
    documents: HashMap<String, Vec<u8>>,
    denied: HashSet<String>,
    save_result: SaveResult,
    saves: Vec<SaveRecord>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            documents: HashMap::new(),
            denied: HashSet::new(),
            save_result: SaveResult::Ok,
            saves: Vec::new(),
        }
    }
}

/// Documents kept in a map keyed by canonical URI.
///
/// Every save returns the configured [`SaveResult`] (default `Ok`); only
/// successful saves replace the stored bytes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(uri: &str) -> String {
        Url::parse(uri)
            .map(|u| canonical_uri(&u).to_string())
            .unwrap_or_else(|_| uri.to_string())
    }

    /// Add a document.
    pub fn with_document(self, uri: &str, data: impl Into<Vec<u8>>) -> Self {
        self.state().documents.insert(Self::key(uri), data.into());
        self
    }

    /// Make loads of `uri` fail with access denied.
    pub fn deny(&self, uri: &str) {
        self.state().denied.insert(Self::key(uri));
    }

    /// Result returned by every subsequent save.
    pub fn set_save_result(&self, result: SaveResult) {
        self.state().save_result = result;
    }

    /// Current stored bytes of `uri`.
    pub fn document(&self, uri: &str) -> Option<Vec<u8>> {
        self.state().documents.get(&Self::key(uri)).cloned()
    }

    pub fn saves(&self) -> Vec<SaveRecord> {
        self.state().saves.clone()
    }

    pub fn save_count(&self) -> usize {
        self.state().saves.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_file(
        &self,
        uri: &Url,
        _credentials: &Credentials,
        work_dir: &Path,
    ) -> Result<(PathBuf, FileInfo), StorageError> {
        let key = canonical_uri(uri).to_string();
        let data = {
            let state = self.state();
            if state.denied.contains(&key) {
                return Err(StorageError::AccessDenied);
            }
            state.documents.get(&key).cloned().ok_or(StorageError::NotFound)?
        };

        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let filename = filename_of(uri);
        let local_path = work_dir.join(&filename);
        tokio::fs::write(&local_path, &data)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok((
            local_path,
            FileInfo {
                filename,
                owner_id: "memory".to_string(),
                modified_time: SystemTime::now(),
                size: data.len() as u64,
            },
        ))
    }

    async fn save_file(
        &self,
        local_path: &Path,
        uri: &Url,
        _credentials: &Credentials,
        is_autosave: bool,
    ) -> SaveResult {
        let key = canonical_uri(uri).to_string();
        let data = tokio::fs::read(local_path).await;

        let mut state = self.state();
        state.saves.push(SaveRecord {
            uri: key.clone(),
            is_autosave,
        });
        let result = state.save_result;
        if result != SaveResult::Ok {
            return result;
        }
        match data {
            Ok(data) => {
                state.documents.insert(key, data);
                SaveResult::Ok
            }
            Err(e) => {
                log::error!("Reading {} for save failed: {}", local_path.display(), e);
                SaveResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new().with_document("mem://docs/a.odt", b"v1".to_vec());
        let uri = Url::parse("mem://docs/a.odt?access_token=t").unwrap();

        let (local, info) = storage
            .load_file(&uri, &Credentials::from_uri(&uri), dir.path())
            .await
            .unwrap();
        assert_eq!(info.filename, "a.odt");
        assert_eq!(std::fs::read(&local).unwrap(), b"v1");

        std::fs::write(&local, b"v2").unwrap();
        assert_eq!(
            storage.save_file(&local, &uri, &Credentials::default(), true).await,
            SaveResult::Ok
        );
        assert_eq!(storage.document("mem://docs/a.odt").unwrap(), b"v2");
        assert_eq!(
            storage.saves(),
            vec![SaveRecord {
                uri: "mem://docs/a.odt".into(),
                is_autosave: true
            }]
        );
    }

    #[tokio::test]
    async fn test_injected_save_result() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new().with_document("mem://docs/a.odt", b"v1".to_vec());
        let uri = Url::parse("mem://docs/a.odt").unwrap();
        let (local, _) = storage
            .load_file(&uri, &Credentials::default(), dir.path())
            .await
            .unwrap();

        storage.set_save_result(SaveResult::DiskFull);
        std::fs::write(&local, b"v2").unwrap();
        assert_eq!(
            storage.save_file(&local, &uri, &Credentials::default(), false).await,
            SaveResult::DiskFull
        );
        assert_eq!(storage.document("mem://docs/a.odt").unwrap(), b"v1");
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_denied() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new().with_document("mem://docs/secret.odt", b"x".to_vec());
        storage.deny("mem://docs/secret.odt");
        let denied = Url::parse("mem://docs/secret.odt").unwrap();
        let missing = Url::parse("mem://docs/none.odt").unwrap();
        assert_eq!(
            storage
                .load_file(&denied, &Credentials::default(), dir.path())
                .await
                .unwrap_err(),
            StorageError::AccessDenied
        );
        assert_eq!(
            storage
                .load_file(&missing, &Credentials::default(), dir.path())
                .await
                .unwrap_err(),
            StorageError::NotFound
        );
    }
}
