//! Local directory backend

use crate::backend::{Backend, StorageLocation};
use crate::{BackendError, ConfigError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Every regular file below a root directory is one blob
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    /// Creates a backend rooted at `root`
    ///
    /// Fails before touching the filesystem when the root is empty.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "directory root cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(path: &Path, source: io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Recursively collects regular files in directory traversal order
///
/// Symlinks are followed only when they point at a regular file, so a
/// linked directory can never send the walk in circles.
fn walk(dir: &Path, files: &mut Vec<StorageLocation>) -> Result<(), BackendError> {
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_error(&path, e))?;

        if file_type.is_dir() {
            walk(&path, files)?;
        } else if file_type.is_file() {
            files.push(StorageLocation::File(path));
        } else if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => files.push(StorageLocation::File(path)),
                Ok(_) => tracing::debug!("Skipping symlink to non-file: {}", path.display()),
                Err(e) => tracing::debug!("Skipping dangling symlink {}: {}", path.display(), e),
            }
        }
    }
    Ok(())
}

fn list_blocking(root: &Path) -> Result<Vec<StorageLocation>, BackendError> {
    let root = fs::canonicalize(root).map_err(|e| io_error(root, e))?;
    if !root.is_dir() {
        return Err(io_error(
            &root,
            io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let mut files = Vec::new();
    walk(&root, &mut files)?;
    Ok(files)
}

#[async_trait]
impl Backend for DirectoryBackend {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn list(&self) -> Result<Vec<StorageLocation>, BackendError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || list_blocking(&root))
            .await
            .map_err(|e| io_error(&self.root, io::Error::new(io::ErrorKind::Other, e)))??;

        tracing::info!(
            "Found {} blobs under {}",
            files.len(),
            self.root.display()
        );
        Ok(files)
    }

    async fn fetch(&self, location: &StorageLocation) -> Result<Bytes, BackendError> {
        match location {
            StorageLocation::File(path) => {
                let data = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
                Ok(Bytes::from(data))
            }
            other => Err(BackendError::ForeignLocation {
                location: other.to_string(),
                backend: self.name(),
            }),
        }
    }
}
