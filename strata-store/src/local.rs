//! Local-filesystem store backend.
//!
//! Logical paths map directly onto a directory tree under the store
//! root. Replacement is atomic: writes land in a uniquely-named staging
//! file next to the target and are renamed into place, so readers see
//! pre-write or post-write bytes, never a torn blob.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::{ObjectStore, Result, StoreError, StoreKind};

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens (or creates) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Returns the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a logical path to a filesystem path, rejecting anything that
    /// could escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty()
            || path
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(StoreError::InvalidPath(path.to_owned()));
        }
        Ok(self.root.join(path))
    }

    /// Returns a uniquely-named staging path in the target's directory.
    fn staging(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        name.push_str(&format!(".{}.tmp", Uuid::new_v4()));
        target.with_file_name(name)
    }

    async fn prepare_write(&self, path: &str) -> Result<(PathBuf, PathBuf)> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = Self::staging(&target);
        Ok((target, staging))
    }
}

fn not_found(path: &str, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_owned())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(fs::try_exists(&target).await?)
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target).await.map_err(|e| not_found(path, e))
    }

    async fn put_content(&self, path: &str, data: &[u8]) -> Result<()> {
        let (target, staging) = self.prepare_write(path).await?;
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn stream_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let target = self.resolve(path)?;
        let file = fs::File::open(&target)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(Box::new(file))
    }

    async fn stream_write(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let (target, staging) = self.prepare_write(path).await?;
        let mut file = fs::File::create(&staging).await?;
        let written = match tokio::io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
        };
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &target).await?;
        Ok(written)
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        let target = self.resolve(path)?;
        let meta = fs::metadata(&target).await.map_err(|e| not_found(path, e))?;
        Ok(meta.len())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }
}
