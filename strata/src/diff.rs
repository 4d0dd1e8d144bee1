//! Ancestry-walking diff engine.
//!
//! The union filesystem presents a single flattened view: a file in the
//! top layer either was not there before (created), was there but now
//! differs (changed), or was there and is removed (deleted). Walking
//! the ancestry newest-first, each top-layer file is classified against
//! the first ancestor that knows about it:
//!
//! - marked deleted in the top layer          → `deleted`
//! - present (not deleted) in the ancestor    → `changed`
//! - whited-out in the ancestor               → `created`
//! - in no ancestor at all                    → `created`
//!
//! A whiteout in an ancestor means that ancestor itself removed the
//! file, so seeing it again on top is a create from the union's
//! perspective.

use crate::Result;
use crate::image::{DiffResult, Images, file_info_map};

/// Computes the diff of `image_id` against its ancestry.
///
/// Requires the image's `files` and `ancestry` artifacts (ancestor
/// inventories are computed lazily when their cache is missing).
pub async fn compute(images: &Images, image_id: &str) -> Result<DiffResult> {
    let ancestry = images.ancestry(image_id).await?;
    let mut top = file_info_map(images.files(image_id).await?);

    let mut diff = DiffResult::default();
    for ancestor_id in ancestry.iter().skip(1) {
        let ancestor = file_info_map(images.files(ancestor_id).await?);
        let pending: Vec<String> = top.keys().cloned().collect();
        for path in pending {
            let Some(info) = top.get(&path).copied() else {
                continue;
            };
            if info.deleted {
                top.remove(&path);
                diff.deleted.insert(path, info);
            } else if let Some(ancestor_info) = ancestor.get(&path) {
                top.remove(&path);
                if ancestor_info.deleted {
                    diff.created.insert(path, info);
                } else {
                    diff.changed.insert(path, info);
                }
            }
        }
    }

    // Whatever no ancestor knew about was created here.
    diff.created.extend(top);
    Ok(diff)
}

/// Computes, serializes, and caches the diff; returns the bytes.
pub async fn compute_and_store(images: &Images, image_id: &str) -> Result<Vec<u8>> {
    let diff = compute(images, image_id).await?;
    let bytes = serde_json::to_vec(&diff)?;
    images.cache_diff(image_id, &bytes).await?;
    Ok(bytes)
}
