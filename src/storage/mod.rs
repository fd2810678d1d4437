//! Durable remote stores behind the local staging tier.
//!
//! The cache backend only ever talks to a [`RemoteStore`]: it hands over a
//! set of local directories plus a key, and the store either persists them
//! (`save`) or fills them in from a previous save (`restore`).  Concrete
//! stores live in the submodules.

pub mod directory;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::{RemoteConfig, RemoteKind};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key was saved before.  Entries are immutable, so callers treat
    /// this as a successful save.
    #[error("cache entry already exists: {key}")]
    AlreadyExists { key: String },
    /// I/O, network or service failure.  Worth retrying.
    #[error("remote store unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.into())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A durable store that persists local directories under a key.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Populate `paths` from the entry saved under `key`.
    ///
    /// Returns `false` when no such entry exists.
    async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<bool, StoreError>;

    /// Persist the files found under `paths` as the entry `key`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when `key` was saved before.
    async fn save(&self, paths: &[PathBuf], key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Helpers shared by the concrete stores
// ---------------------------------------------------------------------------

/// Regular files directly inside `dir`, as `(file_name, full_path)` pairs
/// sorted by name.  A missing directory yields an empty list.
pub(crate) async fn list_files(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the [`RemoteStore`] selected by the configuration.
pub async fn build_store(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.kind {
        RemoteKind::Directory => {
            let store = directory::DirectoryStore::new(&config.directory.path);
            info!(path = %config.directory.path.display(), "directory remote store initialised");
            Ok(Arc::new(store))
        }
        RemoteKind::S3 => {
            let client = s3::build_s3_client(&config.s3).await?;
            let store =
                s3::S3Store::new(client, config.s3.bucket.clone(), config.s3.prefix.clone());
            Ok(Arc::new(store))
        }
    }
}
