//! Image-layer lifecycle engine for a container registry.
//!
//! Accepts container image layers (compressed tar archives), stores
//! them through a pluggable object store, records per-layer metadata
//! and ancestry, and answers read queries about a layer's bytes, its
//! inventory of files, and the diff of that inventory against its
//! ancestors.
//!
//! # Architecture
//!
//! ```text
//! Registry (upload state machine, read queries)
//!  ├── Images (typed accessors over the object store)
//!  │    ├── archive  — tar walk + whiteout semantics
//!  │    └── checksum — sha256 / tarsum pipeline
//!  ├── diff          — ancestry-walking classification
//!  └── worker        — queue pop + per-layer lock + diff compute
//! ```
//!
//! The HTTP surface lives in `strata-http`; storage and coordination
//! backends live in `strata-store` and `strata-queue`.

#![allow(clippy::missing_docs_in_private_items)]

pub mod archive;
pub mod checksum;
pub mod diff;
pub mod image;
pub mod upload;
pub mod worker;

pub use image::{DiffResult, FileEntry, FileKind, FileMeta, Images};
pub use upload::Registry;

/// Result type for registry core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the layer lifecycle engine.
///
/// The first four variants map directly onto client-visible HTTP
/// failures; the rest are infrastructure errors.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A requested image or artifact does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The operation conflicts with a finalized image.
    #[error("{0}")]
    Conflict(String),

    /// The request is malformed or fails checksum negotiation.
    #[error("{0}")]
    Invalid(String),

    /// The layer archive is malformed or uses an unsupported format.
    #[error("layer format not supported: {0}")]
    Format(String),

    /// Object store failure.
    #[error(transparent)]
    Store(#[from] strata_store::StoreError),

    /// Coordination service failure.
    #[error(transparent)]
    Queue(#[from] strata_queue::QueueError),

    /// Filesystem I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` when the error denotes a missing image/artifact,
    /// either directly or as a store-level miss.
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(err) => err.is_not_found(),
            _ => false,
        }
    }
}
