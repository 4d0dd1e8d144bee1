//! Checksum pipeline: the upload tee and both digest schemes.
//!
//! During an upload every chunk read from the client is fanned out to
//! registered handlers before the bytes continue to the store writer:
//! one handler feeds the temp spool (for post-upload inventory
//! extraction and tarsum), another a SHA-256 digest seeded with the
//! image JSON. Backpressure comes for free: a chunk is only requested
//! once every handler has taken the previous one.

use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::archive;
use crate::{Error, Result};
use strata_store::TempSpool;

/// Receives each upload chunk as it streams through.
pub trait ChunkHandler: Send {
    /// Consumes one chunk.
    fn update(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl ChunkHandler for TempSpool {
    fn update(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_chunk(chunk)
    }
}

/// Streaming SHA-256 reported as `sha256:<hex>`.
///
/// Seeded with the image JSON so the digest covers
/// `json bytes || layer bytes`.
#[derive(Debug)]
pub struct Sha256Sink {
    hasher: Sha256,
}

impl Sha256Sink {
    /// Creates a sink whose digest starts with `seed`.
    pub fn seeded(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        Self { hasher }
    }

    /// Finalizes the digest string.
    pub fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

impl ChunkHandler for Sha256Sink {
    fn update(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.hasher.update(chunk);
        Ok(())
    }
}

/// Reader adapter multiplexing each chunk to N handlers.
pub struct FanoutReader<'h, R> {
    inner: R,
    handlers: Vec<&'h mut dyn ChunkHandler>,
}

impl<R: std::fmt::Debug> std::fmt::Debug for FanoutReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutReader")
            .field("inner", &self.inner)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl<'h, R: AsyncRead + Unpin> FanoutReader<'h, R> {
    /// Wraps `inner` with no handlers attached.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            handlers: Vec::new(),
        }
    }

    /// Registers a handler to observe every chunk.
    pub fn add_handler(&mut self, handler: &'h mut dyn ChunkHandler) {
        self.handlers.push(handler);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FanoutReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                if !chunk.is_empty() {
                    for handler in &mut this.handlers {
                        if let Err(err) = handler.update(chunk) {
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Computes the tarsum digest of a layer, reported as
/// `tarsum+sha256:<hex>`.
///
/// Walks the (decompressed, when possible) tar and hashes each member's
/// normalized header fields plus content; the per-member digests are
/// sorted and folded into one digest seeded with the image JSON, making
/// the result independent of both compression and member order.
pub fn tarsum<R: Read + std::io::Seek>(layer: R, json: &[u8]) -> Result<String> {
    let reader = archive::decompressed(layer)?;
    let mut tar = tar::Archive::new(reader);
    let mut member_sums = Vec::new();

    for entry in tar.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        let mut hasher = Sha256::new();
        hasher.update(member_header(entry.header()).map_err(tar_error)?);
        io::copy(&mut entry, &mut hasher).map_err(tar_error)?;
        member_sums.push(hex::encode(hasher.finalize()));
    }

    member_sums.sort();
    let mut hasher = Sha256::new();
    hasher.update(json);
    for sum in &member_sums {
        hasher.update(sum.as_bytes());
    }
    Ok(format!("tarsum+sha256:{}", hex::encode(hasher.finalize())))
}

/// Serializes the digest-relevant header fields in a fixed order.
fn member_header(header: &tar::Header) -> io::Result<String> {
    let mut out = String::new();
    out.push_str("name");
    out.push_str(&String::from_utf8_lossy(&header.path_bytes()));
    out.push_str(&format!("mode{}", header.mode()?));
    out.push_str(&format!("uid{}", header.uid()?));
    out.push_str(&format!("gid{}", header.gid()?));
    out.push_str(&format!("size{}", header.size()?));
    out.push_str(&format!("mtime{}", header.mtime()?));
    out.push_str(&format!("type{}", header.entry_type().as_byte() as char));
    out.push_str("linkname");
    if let Some(link) = header.link_name_bytes() {
        out.push_str(&String::from_utf8_lossy(&link));
    }
    out.push_str("uname");
    if let Some(name) = header.username_bytes() {
        out.push_str(&String::from_utf8_lossy(name));
    }
    out.push_str("gname");
    if let Some(name) = header.groupname_bytes() {
        out.push_str(&String::from_utf8_lossy(name));
    }
    out.push_str(&format!(
        "devmajor{}",
        header.device_major()?.unwrap_or(0)
    ));
    out.push_str(&format!(
        "devminor{}",
        header.device_minor()?.unwrap_or(0)
    ));
    Ok(out)
}

fn tar_error(err: io::Error) -> Error {
    Error::Format(err.to_string())
}
