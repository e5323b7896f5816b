use crate::db::WorkQueue;
use crate::pipeline::CLAIM_HIGH_WATERMARK;
use crate::PendingImage;
use async_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Records requested from the work queue per claim attempt.
const CLAIM_BATCH_SIZE: i64 = 10;

/// Idle wait after a claim that returned nothing (or failed as a unit).
const EMPTY_POLL_DELAY: Duration = Duration::from_secs(1);

/// Wait before re-checking a saturated process queue.
const SATURATED_DELAY: Duration = Duration::from_millis(100);

/// Claim loop: marks pending records as caching and feeds them into the
/// process queue, throttled by the queue's depth. A failed claim is
/// abandoned whole and retried on the next poll cycle.
pub async fn start(
    cancel_token: CancellationToken,
    queue: Arc<dyn WorkQueue>,
    process_tx: Sender<PendingImage>,
) {
    loop {
        if cancel_token.is_cancelled() {
            debug!("Fetcher cancelled");
            break;
        }

        if process_tx.len() >= CLAIM_HIGH_WATERMARK {
            wait(&cancel_token, SATURATED_DELAY).await;
            continue;
        }

        let claimed = match queue.claim(CLAIM_BATCH_SIZE).await {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    if process_tx.send(record).await.is_err() {
                        info!("Process queue closed, fetcher exiting");
                        return;
                    }
                }
                count
            }
            Err(err) => {
                error!(message = "Claim attempt failed", error = ?err);
                0
            }
        };

        if claimed == 0 {
            wait(&cancel_token, EMPTY_POLL_DELAY).await;
        }
    }
    info!("Fetcher stopped.");
}

async fn wait(cancel_token: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel_token.cancelled() => {},
        _ = sleep(delay) => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PendingImage, Status};
    use anyhow::{anyhow, Error};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeQueue {
        batches: Mutex<Vec<Vec<PendingImage>>>,
        claims: AtomicUsize,
        fail_first: AtomicBool,
    }

    impl FakeQueue {
        fn new(batches: Vec<Vec<PendingImage>>) -> Arc<Self> {
            Arc::new(FakeQueue {
                batches: Mutex::new(batches),
                claims: AtomicUsize::new(0),
                fail_first: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl WorkQueue for FakeQueue {
        async fn claim(&self, _max: i64) -> Result<Vec<PendingImage>, Error> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("connection reset"));
            }
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn bulk_delete(&self, _ids: &[i64]) -> Result<(), Error> {
            Ok(())
        }

        async fn find_by_name(&self, _name: &str) -> Result<Option<PendingImage>, Error> {
            Ok(None)
        }
    }

    fn record(id: i64) -> PendingImage {
        PendingImage {
            id,
            name: format!("shop-1-logo-{}", id),
            url: "https://cdn.example.com/a/b.png".into(),
            status: Status::Caching,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_records_reach_the_process_queue_in_order() {
        let (tx, rx) = async_channel::bounded(100);
        let queue = FakeQueue::new(vec![vec![record(1), record(2)]]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(start(cancel.clone(), queue.clone(), tx));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_claim_while_process_queue_is_saturated() {
        let (tx, _rx) = async_channel::bounded(100);
        for id in 0..CLAIM_HIGH_WATERMARK as i64 {
            tx.send(record(id)).await.unwrap();
        }

        let queue = FakeQueue::new(Vec::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(start(cancel.clone(), queue.clone(), tx));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.claims.load(Ordering::SeqCst), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn claim_failure_is_retried_on_the_next_cycle() {
        let (tx, rx) = async_channel::bounded(100);
        let queue = FakeQueue::new(vec![vec![record(7)]]);
        queue.fail_first.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(start(cancel.clone(), queue.clone(), tx));

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id, 7);
        assert!(queue.claims.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
