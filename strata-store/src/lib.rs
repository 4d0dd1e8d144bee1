//! Object storage for the strata image-layer registry.
//!
//! Every per-image artifact (manifest JSON, layer archive, checksum,
//! ancestry, files inventory, diff, upload mark) lives under a logical
//! path derived from the image id. The [`ObjectStore`] trait is the
//! narrow seam between the registry core and whatever holds the bytes;
//! [`LocalStore`] is the filesystem-backed implementation.
//!
//! # Layout
//!
//! ```text
//! {root}/
//!   images/{image_id}/
//!     json        — raw image manifest bytes
//!     layer       — compressed tar archive
//!     ancestry    — JSON list of ids, newest first
//!     _checksum   — "<algorithm>:<hexdigest>"
//!     _files      — JSON files inventory
//!     _diff       — JSON diff result
//!     _inprogress — upload mark (existence only)
//!   repositories/{namespace}/{name}/
//!     _images_list — JSON list of image ids in the repository
//!     _private     — privacy flag (existence only)
//! ```

#![allow(clippy::missing_docs_in_private_items)]

mod local;
mod paths;

use std::io::{self, Seek, Write};

use tokio::io::AsyncRead;

pub use local::LocalStore;
pub use paths::{
    RepoRef, image_ancestry_path, image_checksum_path, image_diff_path, image_files_path,
    image_json_path, image_layer_path, image_mark_path, images_list_path, private_flag_path,
};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from object store operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The logical path has no stored value.
    #[error("no such path: {0}")]
    NotFound(String),

    /// The logical path is not well-formed (absolute or escaping the root).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Returns `true` for the not-found variant.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Which backend a store is; drives the accelerated-download decision.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Bytes live on the local filesystem.
    Local,
    /// Bytes live behind a remote service.
    Remote,
}

/// Pluggable blob storage addressed by logical paths.
///
/// Writes are whole-blob: readers observe pre-write or post-write state,
/// never a torn value. `remove` is idempotent.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `true` iff the path has a stored value.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Reads an entire blob.
    async fn get_content(&self, path: &str) -> Result<Vec<u8>>;

    /// Atomically replaces the blob at `path`.
    async fn put_content(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Opens a lazy chunked reader over the blob.
    async fn stream_read(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Consumes `reader` to completion into `path`, returning the byte
    /// count. A partial write is never visible under the final path.
    async fn stream_write(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Returns the byte length of the blob.
    async fn get_size(&self, path: &str) -> Result<u64>;

    /// Deletes the blob. Missing paths are not an error.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Identifies the backend.
    fn kind(&self) -> StoreKind;

    /// Returns `true` iff the repository carries the privacy flag.
    async fn is_private(&self, repo: &RepoRef) -> Result<bool> {
        self.exists(&private_flag_path(repo)).await
    }
}

/// File-backed spool fed by the upload tee.
///
/// Collects the raw layer bytes during an upload so the files inventory
/// and tarsum can be computed afterwards without re-reading the store.
/// Produced by [`temp_store_handler`]; backed by an anonymous temp file
/// that disappears when dropped.
#[derive(Debug)]
pub struct TempSpool {
    file: std::fs::File,
}

impl TempSpool {
    /// Appends one chunk of upload data.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk)
    }

    /// Finishes the spool, returning the underlying file rewound to the
    /// start.
    pub fn into_file(mut self) -> io::Result<std::fs::File> {
        self.file.flush()?;
        self.file.rewind()?;
        Ok(self.file)
    }
}

/// Creates the temp spool an upload tee writes into.
pub fn temp_store_handler() -> io::Result<TempSpool> {
    Ok(TempSpool {
        file: tempfile::tempfile()?,
    })
}
