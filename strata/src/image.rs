//! Per-image data model and typed artifact accessors.
//!
//! Each image owns seven artifacts in the object store (manifest JSON,
//! layer bytes, checksum, ancestry, files inventory, diff cache, upload
//! mark). [`Images`] is a thin façade doing path derivation and
//! (de)serialization only; cross-artifact invariants belong to the
//! upload state machine.

use std::collections::BTreeMap;
use std::io::Seek;
use std::sync::Arc;

use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::archive;
use crate::{Error, Result};
use strata_store::{
    ObjectStore, image_ancestry_path, image_checksum_path, image_diff_path, image_files_path,
    image_json_path, image_layer_path, image_mark_path,
};

/// Tar member type, encoded with the original one-letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file.
    #[serde(rename = "f")]
    Regular,
    /// Directory.
    #[serde(rename = "d")]
    Directory,
    /// Hard link.
    #[serde(rename = "l")]
    Hardlink,
    /// Symbolic link.
    #[serde(rename = "s")]
    Symlink,
    /// Character device.
    #[serde(rename = "c")]
    Char,
    /// Block device.
    #[serde(rename = "b")]
    Block,
}

/// Everything the inventory records about a file except its path.
///
/// Serializes as the 7-element JSON array
/// `[type, deleted, size, mtime, mode, uid, gid]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Member type.
    pub kind: FileKind,
    /// Whiteout flag: the file is deleted in this layer.
    pub deleted: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time (seconds since epoch).
    pub mtime: u64,
    /// Permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u64,
    /// Owner group id.
    pub gid: u64,
}

impl Serialize for FileMeta {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (
            self.kind,
            self.deleted,
            self.size,
            self.mtime,
            self.mode,
            self.uid,
            self.gid,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileMeta {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let (kind, deleted, size, mtime, mode, uid, gid) =
            Deserialize::deserialize(deserializer)?;
        Ok(Self {
            kind,
            deleted,
            size,
            mtime,
            mode,
            uid,
            gid,
        })
    }
}

/// One files-inventory entry.
///
/// Serializes as the 8-element JSON array
/// `[path, type, deleted, size, mtime, mode, uid, gid]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Normalized absolute path within the layer.
    pub path: String,
    /// Everything else.
    pub meta: FileMeta,
}

impl Serialize for FileEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (
            &self.path,
            self.meta.kind,
            self.meta.deleted,
            self.meta.size,
            self.meta.mtime,
            self.meta.mode,
            self.meta.uid,
            self.meta.gid,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileEntry {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let (path, kind, deleted, size, mtime, mode, uid, gid): (
            String,
            FileKind,
            bool,
            u64,
            u64,
            u32,
            u64,
            u64,
        ) = Deserialize::deserialize(deserializer)?;
        if path.is_empty() {
            return Err(D::Error::custom("empty inventory path"));
        }
        Ok(Self {
            path,
            meta: FileMeta {
                kind,
                deleted,
                size,
                mtime,
                mode,
                uid,
                gid,
            },
        })
    }
}

/// Converts an inventory into a path-keyed map.
pub fn file_info_map(entries: Vec<FileEntry>) -> BTreeMap<String, FileMeta> {
    entries.into_iter().map(|e| (e.path, e.meta)).collect()
}

/// Result of diffing a layer against its ancestry.
///
/// The three maps are pairwise disjoint over their paths; their union
/// is exactly the top layer's inventory. Ordered maps keep the
/// serialized form byte-deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Files removed by this layer.
    pub deleted: BTreeMap<String, FileMeta>,
    /// Files present before and modified here.
    pub changed: BTreeMap<String, FileMeta>,
    /// Files that first appear here (from the union view).
    pub created: BTreeMap<String, FileMeta>,
}

/// Typed accessors for the seven per-image artifacts.
#[derive(Clone)]
pub struct Images {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Images {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Images").finish_non_exhaustive()
    }
}

/// Maps a store-level miss to the public not-found error.
fn image_missing(err: strata_store::StoreError) -> Error {
    if err.is_not_found() {
        Error::NotFound("image not found".to_owned())
    } else {
        err.into()
    }
}

impl Images {
    /// Wraps an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Reads the raw manifest JSON bytes.
    pub async fn json(&self, image_id: &str) -> Result<Vec<u8>> {
        self.store
            .get_content(&image_json_path(image_id))
            .await
            .map_err(image_missing)
    }

    /// Returns `true` iff the manifest JSON exists.
    pub async fn has_json(&self, image_id: &str) -> Result<bool> {
        Ok(self.store.exists(&image_json_path(image_id)).await?)
    }

    /// Writes the manifest JSON verbatim.
    pub async fn put_json(&self, image_id: &str, body: &[u8]) -> Result<()> {
        Ok(self
            .store
            .put_content(&image_json_path(image_id), body)
            .await?)
    }

    /// Opens a streaming reader over the layer bytes.
    pub async fn layer_reader(&self, image_id: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.store
            .stream_read(&image_layer_path(image_id))
            .await
            .map_err(image_missing)
    }

    /// Streams layer bytes into the store, returning the byte count.
    pub async fn store_layer(
        &self,
        image_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        Ok(self
            .store
            .stream_write(&image_layer_path(image_id), reader)
            .await?)
    }

    /// Returns `true` iff layer bytes exist.
    pub async fn has_layer(&self, image_id: &str) -> Result<bool> {
        Ok(self.store.exists(&image_layer_path(image_id)).await?)
    }

    /// Returns the layer size in bytes.
    pub async fn layer_size(&self, image_id: &str) -> Result<u64> {
        self.store
            .get_size(&image_layer_path(image_id))
            .await
            .map_err(image_missing)
    }

    /// Reads the stored checksum, if any.
    pub async fn checksum(&self, image_id: &str) -> Result<Option<String>> {
        match self.store.get_content(&image_checksum_path(image_id)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Validates and persists a client checksum.
    ///
    /// Accepted shape is `<algorithm>:<hexdigest>` with both halves
    /// non-empty.
    pub async fn store_checksum(&self, image_id: &str, checksum: &str) -> Result<()> {
        let mut parts = checksum.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(algorithm), Some(digest), None)
                if !algorithm.is_empty() && !digest.is_empty() => {}
            _ => return Err(Error::Invalid("invalid checksum format".to_owned())),
        }
        Ok(self
            .store
            .put_content(&image_checksum_path(image_id), checksum.as_bytes())
            .await?)
    }

    /// Removes any stored checksum.
    pub async fn clear_checksum(&self, image_id: &str) -> Result<()> {
        Ok(self.store.remove(&image_checksum_path(image_id)).await?)
    }

    /// Reads the ancestry list, newest first.
    pub async fn ancestry(&self, image_id: &str) -> Result<Vec<String>> {
        let bytes = self
            .store
            .get_content(&image_ancestry_path(image_id))
            .await
            .map_err(image_missing)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reads the raw serialized ancestry.
    pub async fn ancestry_bytes(&self, image_id: &str) -> Result<Vec<u8>> {
        self.store
            .get_content(&image_ancestry_path(image_id))
            .await
            .map_err(image_missing)
    }

    /// Computes and persists ancestry from the declared parent.
    ///
    /// Without a parent the chain is just `[image_id]`; otherwise the
    /// parent's stored chain is loaded and this id is prepended. The
    /// previous chain, if any, is overwritten.
    pub async fn generate_ancestry(&self, image_id: &str, parent: Option<&str>) -> Result<()> {
        let chain = match parent {
            None => vec![image_id.to_owned()],
            Some(parent_id) => {
                let mut chain = self.ancestry(parent_id).await?;
                chain.insert(0, image_id.to_owned());
                chain
            }
        };
        let bytes = serde_json::to_vec(&chain)?;
        Ok(self
            .store
            .put_content(&image_ancestry_path(image_id), &bytes)
            .await?)
    }

    /// Writes the upload mark.
    pub async fn set_mark(&self, image_id: &str) -> Result<()> {
        Ok(self
            .store
            .put_content(&image_mark_path(image_id), b"true")
            .await?)
    }

    /// Returns `true` iff the upload mark exists (layer not verified).
    pub async fn has_mark(&self, image_id: &str) -> Result<bool> {
        Ok(self.store.exists(&image_mark_path(image_id)).await?)
    }

    /// Removes the upload mark, the single observable commit point.
    pub async fn clear_mark(&self, image_id: &str) -> Result<()> {
        Ok(self.store.remove(&image_mark_path(image_id)).await?)
    }

    /// Reads the cached files inventory, if present.
    pub async fn cached_files(&self, image_id: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get_content(&image_files_path(image_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Caches a files inventory.
    pub async fn cache_files(&self, image_id: &str, entries: &[FileEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)?;
        Ok(self
            .store
            .put_content(&image_files_path(image_id), &bytes)
            .await?)
    }

    /// Returns the files inventory, computing and caching it from the
    /// stored layer when the upload-time cache write was lost.
    pub async fn files(&self, image_id: &str) -> Result<Vec<FileEntry>> {
        if let Some(cached) = self.cached_files(image_id).await? {
            return Ok(serde_json::from_slice(&cached)?);
        }

        let mut reader = self.layer_reader(image_id).await?;
        let mut spool = tokio::fs::File::from_std(tempfile::tempfile()?);
        tokio::io::copy(&mut reader, &mut spool).await?;
        let mut file = spool.into_std().await;
        let entries = tokio::task::spawn_blocking(move || {
            file.rewind()?;
            archive::scan_layer(file)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        if let Err(err) = self.cache_files(image_id, &entries).await {
            debug!(image_id, error = %err, "caching files inventory failed");
        }
        Ok(entries)
    }

    /// Reads the cached diff, if present.
    pub async fn cached_diff(&self, image_id: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get_content(&image_diff_path(image_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Caches a serialized diff result.
    pub async fn cache_diff(&self, image_id: &str, diff_json: &[u8]) -> Result<()> {
        Ok(self
            .store
            .put_content(&image_diff_path(image_id), diff_json)
            .await?)
    }
}
