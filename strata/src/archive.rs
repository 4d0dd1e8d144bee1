//! Layer archive reading: transparent decompression, tar member walk,
//! union-filesystem whiteout semantics.
//!
//! Layers arrive as tar archives, possibly xz/lzma or gzip compressed.
//! The compression probe validates a small prefix through the decoder
//! and falls back to the raw bytes on a format error, so a corrupt
//! compression header degrades to "plain tar" instead of failing the
//! walk outright. The walk itself is a single forward pass; callers
//! must rewind the source before reusing it.

use std::io::{Read, Seek};

use flate2::read::GzDecoder;
use tar::EntryType;
use xz2::read::XzDecoder;

use crate::image::{FileEntry, FileKind, FileMeta};
use crate::{Error, Result};

/// XZ container magic.
const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
/// Gzip magic.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
/// How many decoded bytes the compression probe validates.
const PROBE_LEN: usize = 512;

/// Walks a layer archive and materializes its files inventory.
///
/// The source may be positioned anywhere; it is rewound first. Fails
/// with [`Error::Format`] on malformed tar input or unknown member
/// types.
pub fn scan_layer<R: Read + Seek>(src: R) -> Result<Vec<FileEntry>> {
    let reader = decompressed(src)?;
    let mut archive = tar::Archive::new(reader);
    let mut inventory = Vec::new();
    for entry in archive.entries().map_err(format_error)? {
        let entry = entry.map_err(format_error)?;
        if let Some(file) = entry_info(entry.header())? {
            inventory.push(file);
        }
    }
    Ok(inventory)
}

/// Wraps the source in the right decompressor.
///
/// Detection is by magic bytes; an xz candidate is additionally probed
/// by decoding a small prefix, falling back to the raw stream when the
/// decoder rejects it.
pub(crate) fn decompressed<'r, R: Read + Seek + 'r>(mut src: R) -> Result<Box<dyn Read + 'r>> {
    src.rewind()?;
    let mut magic = [0u8; 6];
    let got = read_prefix(&mut src, &mut magic)?;
    src.rewind()?;

    if got >= XZ_MAGIC.len() && magic == XZ_MAGIC {
        let mut decoder = XzDecoder::new(src);
        let mut probe = [0u8; PROBE_LEN];
        let valid = decoder.read(&mut probe).is_ok();
        let mut src = decoder.into_inner();
        src.rewind()?;
        if valid {
            return Ok(Box::new(XzDecoder::new(src)));
        }
        return Ok(Box::new(src));
    }
    if got >= GZIP_MAGIC.len() && magic[..2] == GZIP_MAGIC {
        return Ok(Box::new(GzDecoder::new(src)));
    }
    Ok(Box::new(src))
}

/// Reads up to `buf.len()` bytes, stopping early at end of input.
fn read_prefix<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = src.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn format_error(err: std::io::Error) -> Error {
    Error::Format(err.to_string())
}

/// Serializes one tar header into an inventory entry.
///
/// Returns `None` for suppressed members (sentinel-only whiteouts and
/// whiteout metadata).
fn entry_info(header: &tar::Header) -> Result<Option<FileEntry>> {
    let kind = match header.entry_type() {
        EntryType::Regular => FileKind::Regular,
        EntryType::Directory => FileKind::Directory,
        EntryType::Link => FileKind::Hardlink,
        EntryType::Symlink => FileKind::Symlink,
        EntryType::Char => FileKind::Char,
        EntryType::Block => FileKind::Block,
        other => {
            return Err(Error::Format(format!(
                "unknown tar entry type {:?}",
                other.as_byte() as char
            )));
        }
    };

    let mut path = String::from_utf8_lossy(&header.path_bytes()).into_owned();
    // Directories come with a trailing slash; drop it so paths compare
    // across layers.
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path == "." {
        path = "/".to_owned();
    } else if let Some(rest) = path.strip_prefix("./") {
        path = format!("/{rest}");
    }
    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let mut deleted = false;
    if let Some(rest) = path.strip_prefix("/.wh.") {
        if rest.is_empty() {
            // Sentinel-only whiteout: no file to record.
            return Ok(None);
        }
        path = format!("/{rest}");
        deleted = true;
        if path.starts_with("/.wh.") {
            // Union-filesystem metadata (".wh..wh..." entries).
            return Ok(None);
        }
    }

    let meta = FileMeta {
        kind,
        deleted,
        size: header.size().map_err(format_error)?,
        mtime: header.mtime().map_err(format_error)?,
        mode: header.mode().map_err(format_error)?,
        uid: header.uid().map_err(format_error)?,
        gid: header.gid().map_err(format_error)?,
    };
    Ok(Some(FileEntry { path, meta }))
}
