use crate::cache::LinkCache;
use crate::db::WorkQueue;
use crate::pipeline::PipelineContext;
use crate::storage::ObjectStore;
use crate::ImageKey;
use anyhow::Error;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// How long a resolved redirect link stays cached.
const LINK_TTL: Duration = Duration::from_secs(10 * 60 * 60);

/// Shared handles for the HTTP surface. The pipeline context is only read
/// for queue depths; the collaborators are the same ones the pipeline
/// uses.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn WorkQueue>,
    pub store: Arc<dyn ObjectStore>,
    pub cache: Option<LinkCache>,
    pub pipeline: PipelineContext,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/status", get(status))
        .route("/v2/store/:store/image/:store_id/:kind/:id", get(lookup_image))
        .route("/v2/file/:store/:store_id/:kind/:id", get(proxy_file))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server started on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel_token.cancelled_owned())
        .await?;

    Ok(())
}

async fn home() -> &'static str {
    "Image cache server"
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    amount: Option<usize>,
}

async fn status(State(state): State<AppState>, Query(params): Query<StatusParams>) -> Response {
    let Some(amount) = params.amount else {
        return (StatusCode::BAD_REQUEST, "No amount defined as query").into_response();
    };

    Json(state.pipeline.sample(amount)).into_response()
}

/// Redirect lookup: cache hit first, then the work queue (a row means the
/// image is not cached yet, so the origin URL is served), then the
/// canonical file-proxy path.
async fn lookup_image(
    State(state): State<AppState>,
    Path((store, store_id, kind, id)): Path<(String, String, String, String)>,
) -> Response {
    let key = ImageKey {
        store,
        store_id,
        kind,
        item_id: id,
    };
    let identifier = key.identifier();

    if let Some(cache) = &state.cache {
        if let Some(link) = cache.get(&identifier).await {
            return found(&link);
        }
    }

    match state.queue.find_by_name(&identifier).await {
        Err(err) => {
            error!(message = "Lookup failed", name = %identifier, error = ?err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed").into_response()
        }
        Ok(Some(row)) => found(&row.url),
        Ok(None) => {
            let link = format!("/v2/file{}", key.object_path());
            if let Some(cache) = &state.cache {
                cache.set(&identifier, &link, LINK_TTL).await;
            }
            found(&link)
        }
    }
}

/// Stream the object store's public copy of the image through to the
/// caller, content type included.
async fn proxy_file(
    State(state): State<AppState>,
    Path((store, store_id, kind, id)): Path<(String, String, String, String)>,
) -> Response {
    let key = ImageKey {
        store,
        store_id,
        kind,
        item_id: id,
    };
    let url = state.store.public_url(&key.object_path());

    let response = match state.http.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            error!(message = "Error fetching file from object store", url = %url, error = ?err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Server error").into_response();
        }
    };

    if !response.status().is_success() {
        debug!("File not found in object store: {}", response.status());
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}
