//! Batch and media persistence.
//!
//! Layout: one directory per category path segment, nested, holding
//! `products_<timestamp>.json` and one sub-directory per product for media
//! side-files.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::models::ProductRecord;
use crate::utils::sanitize_filename;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Kind of media side-file written next to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Screenshot,
}

impl MediaKind {
    pub fn file_name(&self, index: usize) -> String {
        match self {
            MediaKind::Image => format!("image_{}.jpg", index),
            MediaKind::Screenshot => "screenshot.png".to_string(),
        }
    }
}

/// Where finished batches and media end up.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Write one batch; returns the location of the written file.
    async fn write_batch(
        &self,
        category_path: &[String],
        records: &[ProductRecord],
        timestamp_key: &str,
    ) -> Result<PathBuf, StorageError>;

    /// Write one media file; returns its path relative to the category
    /// directory, as recorded on the product.
    async fn write_media(
        &self,
        category_path: &[String],
        product_key: &str,
        index: usize,
        kind: MediaKind,
        bytes: &[u8],
    ) -> Result<String, StorageError>;
}

/// Plain-filesystem persistence rooted at an output directory.
pub struct FsPersistence {
    root: PathBuf,
}

impl FsPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Nested directory for a category path.
    pub fn category_dir(&self, category_path: &[String]) -> PathBuf {
        category_path
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(sanitize_filename(segment)))
    }

    async fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))
    }

    /// Create `products_<key>.json`, or `products_<key>_<n>.json` when taken.
    async fn create_batch_file(dir: &Path, timestamp_key: &str) -> Result<(PathBuf, tokio::fs::File), StorageError> {
        let mut attempt = 0usize;
        loop {
            let name = if attempt == 0 {
                format!("products_{}.json", timestamp_key)
            } else {
                format!("products_{}_{}.json", timestamp_key, attempt)
            };
            let path = dir.join(name);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} exists, trying next suffix", path.display());
                    attempt += 1;
                }
                Err(e) => return Err(StorageError::io(path, e)),
            }
        }
    }
}

#[async_trait]
impl Persistence for FsPersistence {
    async fn write_batch(
        &self,
        category_path: &[String],
        records: &[ProductRecord],
        timestamp_key: &str,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.category_dir(category_path);
        Self::ensure_dir(&dir).await?;

        let content = serde_json::to_vec_pretty(records)?;
        let (path, mut file) = Self::create_batch_file(&dir, timestamp_key).await?;
        file.write_all(&content)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;

        info!("Wrote {} records to {}", records.len(), path.display());
        Ok(path)
    }

    async fn write_media(
        &self,
        category_path: &[String],
        product_key: &str,
        index: usize,
        kind: MediaKind,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let folder = sanitize_filename(product_key);
        let dir = self.category_dir(category_path).join(&folder);
        Self::ensure_dir(&dir).await?;

        let file_name = kind.file_name(index);
        let path = dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        debug!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(format!("{}/{}", folder, file_name))
    }
}
