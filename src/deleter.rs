use crate::db::WorkQueue;
use crate::StagedArtifact;
use async_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// A flush is forced once a shard buffers more than this many ids.
const FLUSH_THRESHOLD: usize = 10;

/// Periodic flush interval; bounds how long a completed record can sit
/// undeleted in a quiet shard.
const FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// One delete shard: accumulates completed record ids off the shared
/// delete queue and erases them from the work queue in batches. The
/// buffer is private to the shard, so no locking is involved.
pub async fn start(
    cancel_token: CancellationToken,
    delete_rx: Receiver<StagedArtifact>,
    queue: Arc<dyn WorkQueue>,
) {
    let mut buffer: Vec<i64> = Vec::new();
    let mut ticker = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Delete shard cancelled");
                break;
            },
            artifact = delete_rx.recv() => {
                match artifact {
                    Err(_) => break,
                    Ok(artifact) => {
                        buffer.push(artifact.record_id);
                        if buffer.len() > FLUSH_THRESHOLD {
                            flush(&*queue, &mut buffer).await;
                        }
                    }
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&*queue, &mut buffer).await;
                }
            }
        }
    }

    // Anything still buffered has already been uploaded; push the final
    // batch out before the shard goes away.
    if !buffer.is_empty() {
        flush(&*queue, &mut buffer).await;
    }
    info!("Delete shard stopped.");
}

/// Issue one bulk delete for everything buffered. A failed delete is
/// logged and the ids are discarded, not retried.
async fn flush(queue: &dyn WorkQueue, buffer: &mut Vec<i64>) {
    let ids = std::mem::take(buffer);
    debug!("Flushing {} completed records", ids.len());
    if let Err(err) = queue.bulk_delete(&ids).await {
        error!(message = "Bulk delete failed", count = ids.len(), error = ?err);
    }
}
