//! Filesystem-backed blob store

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use stampede_core::traits::{BlobError, BlobStore};

/// Blob store rooted at a local directory
///
/// Each namespace maps to a subdirectory; slashes in object names map to
/// nested directories. Writes are flushed and fsynced before returning,
/// so a completed `put` survives a crash.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, namespace: &str, name: &str) -> Result<PathBuf, BlobError> {
        validate_segment(namespace)?;
        for segment in name.split('/') {
            validate_segment(segment)?;
        }
        Ok(self.root.join(namespace).join(name))
    }
}

fn validate_segment(segment: &str) -> Result<(), BlobError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return Err(BlobError::Unavailable(format!(
            "invalid blob path segment: {segment:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, namespace: &str, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(namespace, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(namespace, name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(format!("{namespace}/{name}")))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
        validate_segment(namespace)?;
        let base = self.root.join(namespace);
        let mut names = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BlobError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&base)
                    .expect("listing stays under the namespace root");
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, BlobError> {
        let path = self.object_path(namespace, name)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}
