use crate::storage::ObjectStore;
use crate::StagedArtifact;
use anyhow::Error;
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Upload worker: pushes staged bytes to the object store one artifact at
/// a time until the done queue closes. Successful uploads forward the
/// artifact to the delete queue; failures are logged and dropped, leaving
/// the staged file and its record behind.
pub async fn start(
    cancel_token: CancellationToken,
    done_rx: Receiver<StagedArtifact>,
    delete_tx: Sender<StagedArtifact>,
    store: Arc<dyn ObjectStore>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Upload worker cancelled");
                break;
            },
            artifact = done_rx.recv() => {
                match artifact {
                    Err(_) => break,
                    Ok(artifact) => {
                        match upload(&*store, &artifact).await {
                            Ok(()) => {
                                if delete_tx.send(artifact).await.is_err() {
                                    info!("Delete queue closed, upload worker exiting");
                                    break;
                                }
                            }
                            Err(err) => {
                                error!(
                                    message = "Error uploading image",
                                    record_id = artifact.record_id,
                                    path = %artifact.destination_path,
                                    error = ?err,
                                );
                            }
                        }
                    }
                }
            }
        }
    }
    info!("Upload worker stopped.");
}

/// Push the staged bytes to the object store, then drop the local copy.
/// The staged file is only removed once the store accepted the upload.
async fn upload(store: &dyn ObjectStore, artifact: &StagedArtifact) -> Result<(), Error> {
    let bytes = tokio::fs::read(&artifact.local_path).await?;
    store
        .put(&artifact.destination_path, bytes, &artifact.content_type)
        .await?;
    tokio::fs::remove_file(&artifact.local_path).await?;

    Ok(())
}
