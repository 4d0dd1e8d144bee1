//! Upload state machine and read-side registry operations.
//!
//! A push is a two-request dance with an optional third step:
//!
//! 1. `PUT json` creates (or retries) the image, writes the upload
//!    mark, and may carry the client checksum up front.
//! 2. `PUT layer` streams the bytes through the checksum tee. With a
//!    stored checksum that matches, the mark is removed; without one
//!    the computed candidates are stashed for step 3.
//! 3. `PUT checksum` finalizes against the stashed candidates.
//!
//! Removing the mark is the single observable commit point. No mismatch
//! path ever clears it, so a failed push stays retryable.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::checksum::{FanoutReader, Sha256Sink, tarsum};
use crate::image::Images;
use crate::worker::{DIFF_QUEUE, DIFF_QUEUE_CAPACITY};
use crate::{Error, Result, archive};
use strata_queue::Coordinator;
use strata_store::{ObjectStore, RepoRef, images_list_path, temp_store_handler};

/// How long stashed checksum candidates outlive their upload.
const CANDIDATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Stash key carrying checksum candidates between the two requests.
fn candidate_key(image_id: &str) -> String {
    format!("upload-checksum:{image_id}")
}

/// The layer lifecycle service: upload state machine plus the read
/// queries the HTTP surface exposes.
#[derive(Clone)]
pub struct Registry {
    images: Images,
    coord: Arc<dyn Coordinator>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Builds a registry over a store façade and a coordinator.
    pub fn new(images: Images, coord: Arc<dyn Coordinator>) -> Self {
        Self { images, coord }
    }

    /// Returns the image artifact accessors.
    pub fn images(&self) -> &Images {
        &self.images
    }

    /// Returns the coordination service handle.
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coord
    }

    /// `PUT json`: creates an image or resets a failed push.
    ///
    /// `client_checksum` is the optional `X-Docker-Checksum` header;
    /// `session_repo` is the repository claimed by the session, which
    /// gates the image id against that repository's images list.
    pub async fn put_json(
        &self,
        image_id: &str,
        body: &[u8],
        client_checksum: Option<&str>,
        session_repo: Option<&RepoRef>,
    ) -> Result<()> {
        let manifest: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| Error::Invalid("invalid json".to_owned()))?;
        let manifest = manifest
            .as_object()
            .ok_or_else(|| Error::Invalid("invalid json".to_owned()))?;

        let declared_id = manifest
            .get("id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::Invalid("missing key `id' in json".to_owned()))?;
        if declared_id != image_id {
            return Err(Error::Invalid("json data contains invalid id".to_owned()));
        }

        if let Some(repo) = session_repo {
            self.check_images_list(image_id, repo).await?;
        }

        let parent = manifest.get("parent").and_then(serde_json::Value::as_str);
        if let Some(parent_id) = parent
            && !self.images.has_json(parent_id).await?
        {
            return Err(Error::NotFound(
                "image depends on a non existing parent".to_owned(),
            ));
        }

        if self.images.has_json(image_id).await? && !self.images.has_mark(image_id).await? {
            return Err(Error::Conflict("image already exists".to_owned()));
        }

        // New image or a retry on a failed push: either adopt the fresh
        // client checksum or drop the stale one.
        match client_checksum {
            Some(checksum) => self.images.store_checksum(image_id, checksum).await?,
            None => self.images.clear_checksum(image_id).await?,
        }

        self.images.set_mark(image_id).await?;
        self.images.put_json(image_id, body).await?;
        self.images.generate_ancestry(image_id, parent).await?;
        Ok(())
    }

    /// `PUT layer`: streams the archive into the store through the
    /// checksum tee, precomputes the files inventory, and commits when
    /// a stored checksum already matches.
    pub async fn put_layer(
        &self,
        image_id: &str,
        body: impl AsyncRead + Send + Unpin,
    ) -> Result<()> {
        let json_bytes = self.images.json(image_id).await?;
        if self.images.has_layer(image_id).await? && !self.images.has_mark(image_id).await? {
            return Err(Error::Conflict("image already exists".to_owned()));
        }

        let mut spool = temp_store_handler()?;
        let mut digest = Sha256Sink::seeded(&json_bytes);
        let mut reader = FanoutReader::new(body);
        reader.add_handler(&mut spool);
        reader.add_handler(&mut digest);
        self.images.store_layer(image_id, &mut reader).await?;

        // Post-upload work off the spool. Neither the inventory cache
        // nor tarsum may fail the upload.
        let spooled = spool.into_file()?;
        let scan_copy = spooled.try_clone()?;
        match tokio::task::spawn_blocking(move || archive::scan_layer(scan_copy))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
        {
            Ok(entries) => {
                if let Err(err) = self.images.cache_files(image_id, &entries).await {
                    debug!(image_id, error = %err, "caching layer file inventory failed");
                }
            }
            Err(err) => debug!(image_id, error = %err, "reading layer file inventory failed"),
        }

        let mut candidates = vec![digest.finish()];
        let seed = json_bytes.clone();
        match tokio::task::spawn_blocking(move || tarsum(spooled, &seed))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
        {
            Ok(sum) => candidates.push(sum),
            Err(err) => debug!(image_id, error = %err, "computing tarsum failed"),
        }

        let Some(stored) = self.images.checksum(image_id).await? else {
            // No checksum stored yet: skip the check but keep the mark.
            // The image is not downloadable until the client follows up.
            self.stash_candidates(image_id, &candidates).await?;
            return Ok(());
        };
        if !candidates.iter().any(|c| *c == stored) {
            debug!(image_id, "layer upload checksum mismatch");
            return Err(Error::Invalid(
                "checksum mismatch, ignoring the layer".to_owned(),
            ));
        }
        self.images.clear_mark(image_id).await?;
        Ok(())
    }

    /// `PUT checksum`: finalizes an upload against the candidates
    /// computed while the layer streamed through.
    pub async fn put_checksum(&self, image_id: &str, checksum: &str) -> Result<()> {
        let candidates = self.stashed_candidates(image_id).await?.ok_or_else(|| {
            Error::Invalid("no checksum candidates found in session".to_owned())
        })?;
        if !self.images.has_json(image_id).await? {
            return Err(Error::NotFound("image not found".to_owned()));
        }
        if !self.images.has_mark(image_id).await? {
            return Err(Error::Conflict(
                "cannot set this image checksum".to_owned(),
            ));
        }

        self.images.store_checksum(image_id, checksum).await?;
        if !candidates.iter().any(|c| c == checksum) {
            debug!(image_id, "client checksum matches no computed digest");
            return Err(Error::Invalid("checksum mismatch".to_owned()));
        }
        self.images.clear_mark(image_id).await?;
        Ok(())
    }

    /// `GET diff` semantics: cached bytes on a hit; on a miss the id is
    /// queued for a worker (best effort) and `None` is returned.
    pub async fn diff_or_enqueue(&self, image_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.images.cached_diff(image_id).await? {
            return Ok(Some(cached));
        }
        if let Err(err) = self
            .coord
            .queue_push(DIFF_QUEUE, DIFF_QUEUE_CAPACITY, image_id)
            .await
        {
            warn!(image_id, error = %err, "enqueueing diff request failed");
        }
        Ok(None)
    }

    /// Enforces that `image_id` belongs to the session's repository.
    async fn check_images_list(&self, image_id: &str, repo: &RepoRef) -> Result<()> {
        let listed = match self
            .images
            .store()
            .get_content(&images_list_path(repo))
            .await
        {
            Ok(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)?
                .iter()
                .any(|id| id == image_id),
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err.into()),
        };
        if listed {
            Ok(())
        } else {
            Err(Error::Invalid(
                "this image does not belong to the repository".to_owned(),
            ))
        }
    }

    async fn stash_candidates(&self, image_id: &str, candidates: &[String]) -> Result<()> {
        let value = serde_json::to_string(candidates)?;
        self.coord
            .stash_put(&candidate_key(image_id), &value, CANDIDATE_TTL)
            .await?;
        Ok(())
    }

    async fn stashed_candidates(&self, image_id: &str) -> Result<Option<Vec<String>>> {
        match self.coord.stash_get(&candidate_key(image_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;
    use strata_queue::MemoryCoordinator;
    use strata_store::LocalStore;

    const IMAGE: &str = "0123456789abcdef";

    async fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let images = Images::new(Arc::new(store));
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        (dir, Registry::new(images, coord))
    }

    fn manifest(id: &str, parent: Option<&str>) -> Vec<u8> {
        let value = match parent {
            Some(parent) => serde_json::json!({"id": id, "parent": parent}),
            None => serde_json::json!({"id": id}),
        };
        serde_json::to_vec(&value).unwrap()
    }

    fn layer_tar(names: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for name in names {
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            header.set_device_major(0).unwrap();
            header.set_device_minor(0).unwrap();
            header.set_cksum();
            builder.append_data(&mut header, name, b"data".as_slice()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn simple_checksum(json: &[u8], layer: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(json);
        hasher.update(layer);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    #[tokio::test]
    async fn checksum_in_put_json_commits_at_layer_upload() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        let layer = layer_tar(&["./foo"]);
        let checksum = simple_checksum(&json, &layer);

        registry
            .put_json(IMAGE, &json, Some(&checksum), None)
            .await
            .unwrap();
        assert!(registry.images().has_mark(IMAGE).await.unwrap());

        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer.clone()))
            .await
            .unwrap();
        assert!(!registry.images().has_mark(IMAGE).await.unwrap());

        // Round-trip: stored layer bytes are byte-identical.
        let mut reader = registry.images().layer_reader(IMAGE).await.unwrap();
        let mut stored = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut stored)
            .await
            .unwrap();
        assert_eq!(stored, layer);
    }

    #[tokio::test]
    async fn deferred_checksum_commits_in_third_request() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        let layer = layer_tar(&["./foo"]);

        registry.put_json(IMAGE, &json, None, None).await.unwrap();
        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer.clone()))
            .await
            .unwrap();
        // Mark survives: nothing has been verified yet.
        assert!(registry.images().has_mark(IMAGE).await.unwrap());

        registry
            .put_checksum(IMAGE, &simple_checksum(&json, &layer))
            .await
            .unwrap();
        assert!(!registry.images().has_mark(IMAGE).await.unwrap());
    }

    #[tokio::test]
    async fn tarsum_candidate_also_commits() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        let layer = layer_tar(&["./foo"]);
        let sum = tarsum(std::io::Cursor::new(layer.clone()), &json).unwrap();

        registry
            .put_json(IMAGE, &json, Some(&sum), None)
            .await
            .unwrap();
        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer))
            .await
            .unwrap();
        assert!(!registry.images().has_mark(IMAGE).await.unwrap());
    }

    #[tokio::test]
    async fn mismatch_keeps_mark_and_allows_retry() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        let layer = layer_tar(&["./foo"]);

        registry.put_json(IMAGE, &json, None, None).await.unwrap();
        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer.clone()))
            .await
            .unwrap();

        let err = registry
            .put_checksum(IMAGE, "sha256:0000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(registry.images().has_mark(IMAGE).await.unwrap());

        registry
            .put_checksum(IMAGE, &simple_checksum(&json, &layer))
            .await
            .unwrap();
        assert!(!registry.images().has_mark(IMAGE).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_stored_checksum_fails_layer_upload() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);

        registry
            .put_json(IMAGE, &json, Some("sha256:feedface"), None)
            .await
            .unwrap();
        let err = registry
            .put_layer(IMAGE, std::io::Cursor::new(layer_tar(&["./foo"])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(registry.images().has_mark(IMAGE).await.unwrap());
    }

    #[tokio::test]
    async fn finalized_image_rejects_reupload() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        let layer = layer_tar(&["./foo"]);
        let checksum = simple_checksum(&json, &layer);

        registry
            .put_json(IMAGE, &json, Some(&checksum), None)
            .await
            .unwrap();
        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer.clone()))
            .await
            .unwrap();

        let err = registry
            .put_json(IMAGE, &json, Some(&checksum), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let err = registry
            .put_layer(IMAGE, std::io::Cursor::new(layer))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn retry_without_header_clears_stale_checksum() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);

        registry
            .put_json(IMAGE, &json, Some("sha256:feedface"), None)
            .await
            .unwrap();
        registry.put_json(IMAGE, &json, None, None).await.unwrap();
        assert_eq!(registry.images().checksum(IMAGE).await.unwrap(), None);
        assert!(registry.images().has_mark(IMAGE).await.unwrap());
    }

    #[tokio::test]
    async fn json_validation_rejects_bad_bodies() {
        let (_dir, registry) = registry().await;
        for body in [
            b"not json".as_slice(),
            b"[1,2,3]".as_slice(),
            b"{\"parent\":\"x\"}".as_slice(),
        ] {
            assert!(matches!(
                registry.put_json(IMAGE, body, None, None).await.unwrap_err(),
                Error::Invalid(_)
            ));
        }
        let mismatched = manifest("someotherid", None);
        assert!(matches!(
            registry
                .put_json(IMAGE, &mismatched, None, None)
                .await
                .unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn parent_must_exist() {
        let (_dir, registry) = registry().await;
        let err = registry
            .put_json(IMAGE, &manifest(IMAGE, Some("missing")), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn ancestry_chains_through_parents() {
        let (_dir, registry) = registry().await;
        registry
            .put_json("root", &manifest("root", None), None, None)
            .await
            .unwrap();
        registry
            .put_json("child", &manifest("child", Some("root")), None, None)
            .await
            .unwrap();
        assert_eq!(
            registry.images().ancestry("child").await.unwrap(),
            vec!["child", "root"]
        );
    }

    #[tokio::test]
    async fn layer_upload_requires_json() {
        let (_dir, registry) = registry().await;
        let err = registry
            .put_layer(IMAGE, std::io::Cursor::new(layer_tar(&["./foo"])))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upload_precomputes_files_inventory() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        registry.put_json(IMAGE, &json, None, None).await.unwrap();
        registry
            .put_layer(IMAGE, std::io::Cursor::new(layer_tar(&["./foo", "./.wh.bar"])))
            .await
            .unwrap();

        let cached = registry.images().cached_files(IMAGE).await.unwrap();
        let entries: Vec<crate::FileEntry> =
            serde_json::from_slice(&cached.unwrap()).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/foo", "/bar"]);
        assert!(entries[1].meta.deleted);
    }

    #[tokio::test]
    async fn corrupt_layer_still_uploads() {
        let (_dir, registry) = registry().await;
        let json = manifest(IMAGE, None);
        registry.put_json(IMAGE, &json, None, None).await.unwrap();
        // Not a tar at all: inventory and tarsum fail silently, the
        // upload itself succeeds.
        registry
            .put_layer(IMAGE, std::io::Cursor::new(vec![0xAB; 4096]))
            .await
            .unwrap();
        assert!(registry.images().has_layer(IMAGE).await.unwrap());
        assert_eq!(registry.images().cached_files(IMAGE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn repository_gate_checks_images_list() {
        let (_dir, registry) = registry().await;
        let repo = RepoRef::parse("acme/web").unwrap();
        let json = manifest(IMAGE, None);

        let err = registry
            .put_json(IMAGE, &json, None, Some(&repo))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        registry
            .images()
            .store()
            .put_content(
                &images_list_path(&repo),
                &serde_json::to_vec(&[IMAGE]).unwrap(),
            )
            .await
            .unwrap();
        registry
            .put_json(IMAGE, &json, None, Some(&repo))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn diff_miss_enqueues_the_id() {
        let (_dir, registry) = registry().await;
        assert_eq!(registry.diff_or_enqueue(IMAGE).await.unwrap(), None);
        assert_eq!(
            registry.coordinator().queue_pop(DIFF_QUEUE).await.unwrap(),
            IMAGE
        );
    }

    #[tokio::test]
    async fn checksum_without_candidates_is_rejected() {
        let (_dir, registry) = registry().await;
        registry
            .put_json(IMAGE, &manifest(IMAGE, None), None, None)
            .await
            .unwrap();
        let err = registry
            .put_checksum(IMAGE, "sha256:feedface")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
