//! Storage backends: where document bytes come from and go back to.
//!
//! ```text
//! ┌──────────────┐  load_file   ┌──────────────┐
//! │ DocumentBroker│ ───────────► │   Storage    │──► file:// (LocalStorage)
//! │              │ ◄─────────── │  (trait obj) │──► in-process (MemoryStorage)
//! └──────────────┘  save_file   └──────────────┘
//! ```
//!
//! A backend copies the document into the broker's work directory on load
//! and writes the work copy back on save. Everything else the broker does
//! only touches the local copy.

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Metadata returned by a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub owner_id: String,
    pub modified_time: SystemTime,
    pub size: u64,
}

/// Credentials passed through to the backend unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
}

impl Credentials {
    /// Read the `access_token` query parameter of a document URI.
    pub fn from_uri(uri: &Url) -> Self {
        Self {
            access_token: uri
                .query_pairs()
                .find(|(key, _)| key == "access_token")
                .map(|(_, value)| value.into_owned()),
        }
    }
}

/// Load failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("access denied")]
    AccessDenied,
    #[error("document not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Error kind used in `error: cmd=load kind=<kind>` replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccessDenied => "accessdenied",
            Self::NotFound => "notfound",
            Self::Unavailable(_) => "storageunavailable",
        }
    }
}

/// Outcome of writing the work copy back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    Ok,
    DiskFull,
    /// The stored document changed since it was loaded
    Conflict,
    Unauthorized,
    Failed,
}

/// A document storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Copy the document at `uri` into `work_dir` and return the local path.
    async fn load_file(
        &self,
        uri: &Url,
        credentials: &Credentials,
        work_dir: &Path,
    ) -> Result<(PathBuf, FileInfo), StorageError>;

    /// Write `local_path` back to `uri`.
    async fn save_file(
        &self,
        local_path: &Path,
        uri: &Url,
        credentials: &Credentials,
        is_autosave: bool,
    ) -> SaveResult;
}

/// `uri` without query and fragment.
pub fn canonical_uri(uri: &Url) -> Url {
    let mut canonical = uri.clone();
    canonical.set_query(None);
    canonical.set_fragment(None);
    canonical
}

/// Last path segment of `uri`, or `document` when there is none.
pub(crate) fn filename_of(uri: &Url) -> String {
    uri.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "document".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_from_uri() {
        let uri = Url::parse("https://host/wopi/files/42?access_token=abc&x=1").unwrap();
        assert_eq!(Credentials::from_uri(&uri).access_token.as_deref(), Some("abc"));
        let bare = Url::parse("file:///tmp/a.odt").unwrap();
        assert_eq!(Credentials::from_uri(&bare), Credentials::default());
    }

    #[test]
    fn test_canonical_uri_drops_query() {
        let uri = Url::parse("https://host/files/a.odt?access_token=abc#frag").unwrap();
        assert_eq!(canonical_uri(&uri).as_str(), "https://host/files/a.odt");
    }

    #[test]
    fn test_filename_of() {
        assert_eq!(filename_of(&Url::parse("file:///tmp/report.odt").unwrap()), "report.odt");
        assert_eq!(filename_of(&Url::parse("https://host/").unwrap()), "document");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(StorageError::AccessDenied.kind(), "accessdenied");
        assert_eq!(StorageError::NotFound.kind(), "notfound");
        assert_eq!(StorageError::Unavailable("x".into()).kind(), "storageunavailable");
    }
}
