//! HTTP surface for camwatch: a viewer index, one `multipart/x-mixed-replace`
//! MJPEG stream per camera, and health and status endpoints.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use camwatch::{wait_for_shutdown, CameraId, LatestFrameBroadcaster, PipelineState, ViewerSession};

pub const BOUNDARY: &str = "frame";
const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const INVALID_CAMERA: &str = "Invalid camera ID";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: LatestFrameBroadcaster,
    pub pipeline_states: Arc<HashMap<CameraId, watch::Receiver<PipelineState>>>,
    /// Open viewer streams end when this turns true.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        broadcaster: LatestFrameBroadcaster,
        pipeline_states: HashMap<CameraId, watch::Receiver<PipelineState>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broadcaster,
            pipeline_states: Arc::new(pipeline_states),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/video_feed/:camera_id", get(video_feed))
        .with_state(state)
}

/// Binds, then serves in the background until `state.shutdown` turns true.
pub async fn start_server(state: AppState, cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    let local_addr = listener.local_addr()?;

    let mut shutdown = state.shutdown.clone();
    let app = router(state);
    info!(addr = %local_addr, "camwatch server listening on http://{local_addr}");

    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
            .await;
        match result {
            Ok(()) => info!("camwatch server stopped"),
            Err(e) => error!(error = %e, "camwatch server failed"),
        }
    });

    Ok(server)
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let mut page = String::from(
        "<!doctype html>\n<html>\n<head><title>camwatch</title></head>\n<body>\n<h2>camwatch</h2>\n",
    );
    for id in state.broadcaster.camera_ids() {
        page.push_str(&format!(
            "<figure><img src=\"/video_feed/{id}\" alt=\"camera {id}\"><figcaption>Camera {id}</figcaption></figure>\n"
        ));
    }
    page.push_str("</body>\n</html>\n");
    Html(page)
}

#[derive(Debug, Serialize)]
struct CameraStatus {
    id: CameraId,
    state: Option<&'static str>,
    version: u64,
    sequence: Option<u64>,
    viewers: usize,
}

async fn status(State(state): State<AppState>) -> Json<Vec<CameraStatus>> {
    let cameras = state
        .broadcaster
        .camera_ids()
        .into_iter()
        .map(|id| {
            let latest = state.broadcaster.latest(id).ok().flatten();
            CameraStatus {
                id,
                state: state.pipeline_states.get(&id).map(|rx| rx.borrow().as_str()),
                version: latest.as_ref().map_or(0, |p| p.version),
                sequence: latest.as_ref().map(|p| p.frame.sequence),
                viewers: state.broadcaster.viewer_count(id).unwrap_or(0),
            }
        })
        .collect();
    Json(cameras)
}

fn invalid_camera() -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONNECTION, "close")],
        INVALID_CAMERA,
    )
        .into_response()
}

async fn video_feed(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let Ok(camera_id) = raw_id.parse::<CameraId>() else {
        debug!(camera_id = %raw_id, "rejecting non-numeric camera id");
        return invalid_camera();
    };

    let session = match state.broadcaster.subscribe(camera_id) {
        Ok(session) => session,
        Err(e) => {
            warn!(camera_id, error = %e, "rejecting viewer");
            return invalid_camera();
        }
    };

    let body = Body::from_stream(mjpeg_parts(session, state.shutdown.clone()));
    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Part header for one frame; the frame bytes and a CRLF follow it.
pub fn part_header(jpeg_len: usize) -> Bytes {
    Bytes::from(format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {jpeg_len}\r\n\r\n"
    ))
}

/// The body of one viewer connection. Ends on shutdown or when the broadcaster
/// closes; a disconnecting viewer drops it, which drops the session.
fn mjpeg_parts(
    mut session: ViewerSession,
    mut shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let camera_id = session.camera_id();
    async_stream::stream! {
        loop {
            let published = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                next = session.next() => match next {
                    Ok(published) => published,
                    Err(e) => {
                        debug!(camera_id, error = %e, "ending viewer stream");
                        break;
                    }
                },
            };

            yield Ok(part_header(published.frame.jpeg.len()));
            yield Ok(published.frame.jpeg.clone());
            yield Ok(Bytes::from_static(b"\r\n"));
        }
    }
}
