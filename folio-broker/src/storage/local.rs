//! `file://` storage.
//!
//! Loading copies the source file into the work directory and remembers the
//! source's modification time. A save finding a different time on the source
//! reports [`SaveResult::Conflict`] instead of overwriting someone else's
//! change.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;
use url::Url;

use super::{filename_of, Credentials, FileInfo, SaveResult, Storage, StorageError};

/// Storage backed by the local filesystem.
#[derive(Debug, Default)]
pub struct LocalStorage {
    /// Source path -> modification time at the last load or save
    known_mtimes: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn source_path(uri: &Url) -> Result<PathBuf, StorageError> {
        if uri.scheme() != "file" {
            return Err(StorageError::Unavailable(format!(
                "unsupported scheme `{}`",
                uri.scheme()
            )));
        }
        uri.to_file_path()
            .map_err(|_| StorageError::Unavailable(format!("not a local path: {uri}")))
    }
}

fn load_error(e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound,
        ErrorKind::PermissionDenied => StorageError::AccessDenied,
        _ => StorageError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn load_file(
        &self,
        uri: &Url,
        _credentials: &Credentials,
        work_dir: &Path,
    ) -> Result<(PathBuf, FileInfo), StorageError> {
        let source = Self::source_path(uri)?;
        let metadata = tokio::fs::metadata(&source).await.map_err(load_error)?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        let modified_time = metadata.modified().map_err(load_error)?;

        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let filename = filename_of(uri);
        let local_path = work_dir.join(&filename);
        tokio::fs::copy(&source, &local_path).await.map_err(load_error)?;

        self.known_mtimes
            .lock()
            .await
            .insert(source.clone(), modified_time);
        log::info!("Loaded {} into {}", source.display(), local_path.display());

        Ok((
            local_path,
            FileInfo {
                filename,
                owner_id: String::new(),
                modified_time,
                size: metadata.len(),
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
        let Ok(source) = Self::source_path(uri) else {
            return SaveResult::Failed;
        };

        let mut known = self.known_mtimes.lock().await;
        let current = tokio::fs::metadata(&source)
            .await
            .and_then(|m| m.modified())
            .ok();
        if let (Some(expected), Some(current)) = (known.get(&source), current) {
            if *expected != current {
                log::warn!("{} changed on disk since it was loaded", source.display());
                return SaveResult::Conflict;
            }
        }

        if let Err(e) = tokio::fs::copy(local_path, &source).await {
            log::error!("Saving {} failed: {}", source.display(), e);
            return match e.kind() {
                ErrorKind::StorageFull => SaveResult::DiskFull,
                ErrorKind::PermissionDenied => SaveResult::Unauthorized,
                _ => SaveResult::Failed,
            };
        }

        if let Ok(mtime) = tokio::fs::metadata(&source).await.and_then(|m| m.modified()) {
            known.insert(source.clone(), mtime);
        }
        log::info!(
            "Saved {} ({})",
            source.display(),
            if is_autosave { "autosave" } else { "explicit" }
        );
        SaveResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn file_url(path: &Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_load_copies_into_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("report.odt");
        std::fs::write(&source, b"hello").unwrap();
        let work = dir.path().join("work");

        let storage = LocalStorage::new();
        let (local, info) = storage
            .load_file(&file_url(&source), &Credentials::default(), &work)
            .await
            .unwrap();
        assert_eq!(local, work.join("report.odt"));
        assert_eq!(std::fs::read(&local).unwrap(), b"hello");
        assert_eq!(info.filename, "report.odt");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let missing = file_url(&dir.path().join("missing.odt"));
        assert_eq!(
            storage
                .load_file(&missing, &Credentials::default(), dir.path())
                .await
                .unwrap_err(),
            StorageError::NotFound
        );
        let remote = Url::parse("https://host/a.odt").unwrap();
        assert!(matches!(
            storage.load_file(&remote, &Credentials::default(), dir.path()).await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_save_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.odt");
        std::fs::write(&source, b"v1").unwrap();
        let storage = LocalStorage::new();
        let uri = file_url(&source);
        let (local, _) = storage
            .load_file(&uri, &Credentials::default(), &dir.path().join("work"))
            .await
            .unwrap();

        std::fs::write(&local, b"v2").unwrap();
        let result = storage
            .save_file(&local, &uri, &Credentials::default(), false)
            .await;
        assert_eq!(result, SaveResult::Ok);
        assert_eq!(std::fs::read(&source).unwrap(), b"v2");

        // A second save right after is not a conflict
        assert_eq!(
            storage.save_file(&local, &uri, &Credentials::default(), true).await,
            SaveResult::Ok
        );
    }

    #[tokio::test]
    async fn test_save_detects_external_change() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.odt");
        std::fs::write(&source, b"v1").unwrap();
        let storage = LocalStorage::new();
        let uri = file_url(&source);
        let (local, info) = storage
            .load_file(&uri, &Credentials::default(), &dir.path().join("work"))
            .await
            .unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&source).unwrap();
        file.set_modified(info.modified_time + Duration::from_secs(60)).unwrap();
        drop(file);

        assert_eq!(
            storage.save_file(&local, &uri, &Credentials::default(), false).await,
            SaveResult::Conflict
        );
        assert_eq!(std::fs::read(&source).unwrap(), b"v1");
    }
}
