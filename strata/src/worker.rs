//! Diff worker: pops layer ids off the shared queue and computes diffs.
//!
//! Any number of workers may run against the same coordinator. The
//! queue may hold duplicate ids; dedup happens at the per-layer lock,
//! not in the queue. A worker that loses the lock race skips the id,
//! since the holder is computing the same diff. Lock expiry bounds
//! recovery time when a worker dies mid-computation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::image::Images;
use crate::{Result, diff};
use strata_queue::Coordinator;

/// Queue key holding pending diff requests.
pub const DIFF_QUEUE: &str = "diff-worker";
/// Lock namespace guarding per-layer diff computation.
pub const DIFF_LOCK_NAMESPACE: &str = "diff-worker-lock";
/// Capacity of the capped diff queue.
pub const DIFF_QUEUE_CAPACITY: usize = 1024;
/// How long a worker may hold a layer lock before it is reclaimable.
pub const DIFF_LOCK_EXPIRES: Duration = Duration::from_secs(5 * 60);

/// Runs the worker loop forever.
///
/// Returns only when the coordinator fails; per-layer errors are logged
/// and the loop moves on.
pub async fn run(images: Images, coord: Arc<dyn Coordinator>) -> Result<()> {
    info!("diff worker started");
    loop {
        let layer_id = coord.queue_pop(DIFF_QUEUE).await?;
        if let Err(err) = process(&images, coord.as_ref(), &layer_id).await {
            warn!(layer_id, error = %err, "diff computation failed");
        }
    }
}

/// Handles one popped layer id.
///
/// Takes the layer lock with an immediate give-up: when another worker
/// already holds it, the id is skipped. Under the lock the diff cache
/// is re-checked before computing; the registry checked too, but the
/// id may have sat in the queue for a while.
pub async fn process(images: &Images, coord: &dyn Coordinator, layer_id: &str) -> Result<()> {
    let acquired = coord
        .try_lock(
            DIFF_LOCK_NAMESPACE,
            layer_id,
            DIFF_LOCK_EXPIRES,
            Duration::ZERO,
        )
        .await?;
    if !acquired {
        debug!(layer_id, "another worker is processing this layer, skipping");
        return Ok(());
    }

    let outcome = compute_if_missing(images, layer_id).await;
    coord.unlock(DIFF_LOCK_NAMESPACE, layer_id).await?;
    outcome
}

async fn compute_if_missing(images: &Images, layer_id: &str) -> Result<()> {
    if images.cached_diff(layer_id).await?.is_some() {
        return Ok(());
    }
    info!(layer_id, "processing diff");
    diff::compute_and_store(images, layer_id).await?;
    Ok(())
}
