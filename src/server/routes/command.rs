use crate::error::ApiError;
use crate::server::routes::ok_envelope;
use crate::AppContext;
use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
struct RawCommand {
    method: String,
    #[serde(default)]
    params: Value,
    /// Per-command timeout override in milliseconds.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// `POST /command` — forward a raw IPC command for advanced callers. No
/// schema validation; the browser's own error reply comes back in the
/// envelope.
pub async fn command(
    State(ctx): State<Arc<AppContext>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let raw: RawCommand = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("expected {{method, params}}: {e}")))?;
    if raw.method.is_empty() {
        return Err(ApiError::BadRequest("method must not be empty".into()));
    }
    let timeout = raw.timeout_ms.map(std::time::Duration::from_millis);
    let result = ctx.ipc.call(&raw.method, raw.params, timeout).await?;
    Ok(ok_envelope(result))
}
