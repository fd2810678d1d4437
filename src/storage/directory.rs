//! Remote store backed by a plain directory tree.
//!
//! Entries are laid out as `{root}/{key}/{index}/{file}` where `index` is the
//! position of the source path in the `paths` slice.  Saves are staged in a
//! scratch directory under the root and published with a single rename, so a
//! reader never observes a half-written entry.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, instrument};

use super::{list_files, RemoteStore, StoreError};

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait::async_trait]
impl RemoteStore for DirectoryStore {
    #[instrument(skip(self, paths), fields(root = %self.root.display()))]
    async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<bool, StoreError> {
        let entry = self.entry_dir(key);
        if !tokio::fs::try_exists(&entry).await? {
            debug!("entry not present");
            return Ok(false);
        }

        for (index, dest) in paths.iter().enumerate() {
            let src = entry.join(index.to_string());
            tokio::fs::create_dir_all(dest)
                .await
                .with_context(|| format!("create {}", dest.display()))
                .map_err(StoreError::Unavailable)?;
            for (name, path) in list_files(&src).await? {
                tokio::fs::copy(&path, dest.join(&name))
                    .await
                    .with_context(|| format!("copy {} into {}", path.display(), dest.display()))
                    .map_err(StoreError::Unavailable)?;
            }
        }

        debug!("entry restored");
        Ok(true)
    }

    #[instrument(skip(self, paths), fields(root = %self.root.display()))]
    async fn save(&self, paths: &[PathBuf], key: &str) -> Result<(), StoreError> {
        let entry = self.entry_dir(key);
        if tokio::fs::try_exists(&entry).await? {
            return Err(StoreError::AlreadyExists { key: key.to_string() });
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let scratch = self
            .root
            .join(format!(".incoming-{}", uuid::Uuid::new_v4().simple()));

        let staged = stage(&scratch, paths).await;
        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(e);
        }

        match tokio::fs::rename(&scratch, &entry).await {
            Ok(()) => {
                debug!("entry saved");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                // Lost a race against a concurrent save of the same key.
                if tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                    Err(StoreError::AlreadyExists { key: key.to_string() })
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

async fn stage(scratch: &Path, paths: &[PathBuf]) -> Result<(), StoreError> {
    for (index, src) in paths.iter().enumerate() {
        let dest = scratch.join(index.to_string());
        tokio::fs::create_dir_all(&dest).await?;
        for (name, path) in list_files(src).await? {
            tokio::fs::copy(&path, dest.join(&name))
                .await
                .with_context(|| format!("copy {} into remote store", path.display()))
                .map_err(StoreError::Unavailable)?;
        }
    }
    Ok(())
}
