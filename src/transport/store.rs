//! Credential storage.
//!
//! | Store | Backing |
//! |-------|---------|
//! | [`MemoryCredentialStore`] | process memory |
//! | [`FileCredentialStore`] | JSON document on disk, atomic replace |

// ============================================================================
// Imports
// ============================================================================

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Credentials;

// ============================================================================
// Constants
// ============================================================================

/// Current on-disk document version.
const DOCUMENT_VERSION: u32 = 1;

/// File name used when the store is pointed at a directory.
const DEFAULT_FILE_NAME: &str = "credentials.json";

// ============================================================================
// CredentialStore
// ============================================================================

/// Persistence for the transport's credential blob.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads the stored credentials, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data exists but cannot be read.
    async fn load(&self) -> Result<Option<Credentials>>;

    /// Replaces the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn save(&self, credentials: &Credentials) -> Result<()>;
}

// ============================================================================
// MemoryCredentialStore
// ============================================================================

/// Keeps credentials in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Option<Credentials>>,
    saves: Mutex<usize>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with credentials.
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Mutex::new(Some(credentials)),
            saves: Mutex::new(0),
        }
    }

    /// Returns the number of successful saves.
    #[inline]
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    /// Returns the current credentials without going through the trait.
    #[must_use]
    pub fn current(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.credentials.lock().clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        *self.credentials.lock() = Some(credentials.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

// ============================================================================
// FileCredentialStore
// ============================================================================

/// On-disk credential document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialDocument {
    version: u32,
    credentials: Credentials,
    updated_at: DateTime<Utc>,
}

/// Stores credentials as a JSON document.
///
/// Writes go to a temporary file in the same directory which then replaces
/// the target, so a crash mid-write never leaves a truncated document.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Creates a store writing to `path`.
    ///
    /// If `path` is an existing directory, `credentials.json` inside it is
    /// used.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let path = if path.is_dir() {
            path.join(DEFAULT_FILE_NAME)
        } else {
            path
        };
        Self { path }
    }

    /// Returns the document path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_document(path: &Path, document: &CredentialDocument) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, document)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored credentials");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let document: CredentialDocument = serde_json::from_slice(&raw)?;
        if document.version != DOCUMENT_VERSION {
            return Err(Error::storage(format!(
                "unsupported credential document version {} in {}",
                document.version,
                self.path.display()
            )));
        }

        debug!(
            path = %self.path.display(),
            updated_at = %document.updated_at,
            "Loaded stored credentials"
        );
        Ok(Some(document.credentials))
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        let document = CredentialDocument {
            version: DOCUMENT_VERSION,
            credentials: credentials.clone(),
            updated_at: Utc::now(),
        };
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || Self::write_document(&path, &document))
            .await
            .map_err(|e| Error::storage(format!("credential write task failed: {e}")))??;

        debug!(path = %self.path.display(), bytes = credentials.len(), "Saved credentials");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
