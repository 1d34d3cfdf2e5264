use crate::error::ApiError;
use crate::server::routes::ok_envelope;
use crate::video::mjpeg;
use crate::AppContext;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

/// `GET /video/frame/{ctx}` — the latest JPEG for a context.
pub async fn frame(
    State(ctx): State<Arc<AppContext>>,
    Path(context_id): Path<String>,
) -> Result<Response, ApiError> {
    let frame = ctx.video.single_frame(&context_id).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header("X-Frame-Width", frame.width)
        .header("X-Frame-Height", frame.height)
        .header("X-Frame-Timestamp", frame.timestamp_ms)
        .body(Body::from(frame.data))
        .map_err(|_| ApiError::Internal)
}

/// `GET /video/stream/{ctx}` — MJPEG until the client disconnects, the
/// stream stops, or the writer goes quiet.
pub async fn stream(
    State(ctx): State<Arc<AppContext>>,
    Path(context_id): Path<String>,
) -> Result<Response, ApiError> {
    let parts = ctx.video.mjpeg_stream(&context_id)?;
    let body = Body::from_stream(ReceiverStream::new(parts));
    Response::builder()
        .header(header::CONTENT_TYPE, mjpeg::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|_| ApiError::Internal)
}

#[derive(Deserialize, Default)]
struct StartParams {
    fps: Option<u32>,
    quality: Option<u32>,
}

/// `POST /video/start/{ctx}` — REST control over the stream lifecycle.
pub async fn start(
    State(ctx): State<Arc<AppContext>>,
    Path(context_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params: StartParams = if body.is_empty() {
        StartParams::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("bad video params: {e}")))?
    };
    let result = ctx
        .video
        .start(
            &ctx.ipc,
            &context_id,
            params.fps.unwrap_or(10),
            params.quality.unwrap_or(80),
        )
        .await?;
    Ok(ok_envelope(json!({
        "context_id": context_id,
        "result": result,
    })))
}

/// `POST /video/stop/{ctx}`
pub async fn stop(
    State(ctx): State<Arc<AppContext>>,
    Path(context_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let result = ctx.video.stop(&ctx.ipc, &context_id).await?;
    Ok(ok_envelope(json!({
        "context_id": context_id,
        "result": result,
    })))
}

/// `GET /video/streams` — active stream contexts.
pub async fn list(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    ok_envelope(ctx.video.list())
}
