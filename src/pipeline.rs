use crate::db::WorkQueue;
use crate::storage::ObjectStore;
use crate::{deleter, fetcher, processor, uploader, PendingImage, StagedArtifact};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

pub const PROCESS_QUEUE_CAPACITY: usize = 100;
pub const DONE_QUEUE_CAPACITY: usize = 100;
pub const DELETE_QUEUE_CAPACITY: usize = 20;

/// The fetcher refuses to claim new work while the process queue sits at
/// or above this depth.
pub const CLAIM_HIGH_WATERMARK: usize = 50;

/// The three bounded stage queues. Handles are cheap clones sharing the
/// same buffers, so one context is built at startup and handed to every
/// component; tests construct their own in isolation.
#[derive(Clone)]
pub struct PipelineContext {
    pub process_tx: async_channel::Sender<PendingImage>,
    pub process_rx: async_channel::Receiver<PendingImage>,
    pub done_tx: async_channel::Sender<StagedArtifact>,
    pub done_rx: async_channel::Receiver<StagedArtifact>,
    pub delete_tx: async_channel::Sender<StagedArtifact>,
    pub delete_rx: async_channel::Receiver<StagedArtifact>,
}

impl PipelineContext {
    pub fn new() -> Self {
        let (process_tx, process_rx) = async_channel::bounded(PROCESS_QUEUE_CAPACITY);
        let (done_tx, done_rx) = async_channel::bounded(DONE_QUEUE_CAPACITY);
        let (delete_tx, delete_rx) = async_channel::bounded(DELETE_QUEUE_CAPACITY);

        PipelineContext {
            process_tx,
            process_rx,
            done_tx,
            done_rx,
            delete_tx,
            delete_rx,
        }
    }

    /// Sample the instantaneous queue depths `amount` times back to back.
    /// Advisory only: depths are read without synchronizing against the
    /// workers, so a report can be stale by the time it is serialized.
    pub fn sample(&self, amount: usize) -> StatusReport {
        let mut report = StatusReport::default();
        for _ in 0..amount {
            report.process.push(self.process_tx.len());
            report.done.push(self.done_tx.len());
            report.delete.push(self.delete_tx.len());
        }

        report
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct StatusReport {
    pub process: Vec<usize>,
    pub done: Vec<usize>,
    pub delete: Vec<usize>,
}

/// Worker counts and staging directory for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub process_workers: usize,
    pub upload_workers: usize,
    pub delete_workers: usize,
    pub tmp_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            process_workers: 20,
            upload_workers: 20,
            delete_workers: 10,
            tmp_dir: PathBuf::from("./tmp"),
        }
    }
}

/// Spawn every pipeline stage: one fetcher, the process and upload pools,
/// and the delete shards. The returned handles finish once `cancel_token`
/// fires or the stage queues close.
pub fn start(
    ctx: &PipelineContext,
    config: &PipelineConfig,
    cancel_token: CancellationToken,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ObjectStore>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        let process_tx = ctx.process_tx.clone();
        tasks.push(tokio::spawn(
            async move { fetcher::start(cancel_token, queue, process_tx).await }
                .instrument(info_span!("fetcher")),
        ));
    }

    let http = reqwest::Client::new();
    for _ in 0..config.process_workers {
        let cancel_token = cancel_token.clone();
        let process_rx = ctx.process_rx.clone();
        let done_tx = ctx.done_tx.clone();
        let tmp_dir = config.tmp_dir.clone();
        let http = http.clone();
        tasks.push(tokio::spawn(
            async move { processor::start(cancel_token, process_rx, done_tx, tmp_dir, http).await }
                .instrument(info_span!("processor")),
        ));
    }

    for _ in 0..config.upload_workers {
        let cancel_token = cancel_token.clone();
        let done_rx = ctx.done_rx.clone();
        let delete_tx = ctx.delete_tx.clone();
        let store = store.clone();
        tasks.push(tokio::spawn(
            async move { uploader::start(cancel_token, done_rx, delete_tx, store).await }
                .instrument(info_span!("uploader")),
        ));
    }

    for _ in 0..config.delete_workers {
        let cancel_token = cancel_token.clone();
        let delete_rx = ctx.delete_rx.clone();
        let queue = queue.clone();
        tasks.push(tokio::spawn(
            async move { deleter::start(cancel_token, delete_rx, queue).await }
                .instrument(info_span!("deleter")),
        ));
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;

    fn record(id: i64) -> PendingImage {
        PendingImage {
            id,
            name: format!("shop-1-logo-{}", id),
            url: "https://cdn.example.com/a/b.png".into(),
            status: Status::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn idle_samples_repeat_the_same_depths() {
        let ctx = PipelineContext::new();
        ctx.process_tx.send(record(1)).await.unwrap();
        ctx.process_tx.send(record(2)).await.unwrap();

        let report = ctx.sample(3);
        assert_eq!(report.process, vec![2, 2, 2]);
        assert_eq!(report.done, vec![0, 0, 0]);
        assert_eq!(report.delete, vec![0, 0, 0]);
    }

    #[test]
    fn status_report_serializes_with_queue_names() {
        let report = StatusReport {
            process: vec![1],
            done: vec![2],
            delete: vec![3],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"process": [1], "done": [2], "delete": [3]})
        );
    }
}
