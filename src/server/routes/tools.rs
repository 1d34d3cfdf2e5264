use crate::error::ApiError;
use crate::server::routes::ok_envelope;
use crate::tools;
use crate::AppContext;
use axum::extract::{Path, State};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

/// `GET /tools` — the full tool schema document.
pub async fn list_tools(State(_ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(tools::schema_json())
}

/// `GET /tools/{name}` — one tool's schema.
pub async fn get_tool(
    State(_ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = tools::find(&name).ok_or(ApiError::NotFound)?;
    Ok(Json(tools::tool_json(tool)))
}

/// Parse a request body as a JSON object, tolerating an absent body.
fn parse_params(body: &Bytes) -> Result<Value, ApiError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("request body is not valid JSON: {e}")))
}

/// `POST /execute/{tool}` — validate against the declared schema, translate
/// into an IPC command, wrap the reply in the response envelope.
pub async fn execute(
    State(ctx): State<Arc<AppContext>>,
    Path(tool_name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let tool = tools::find(&tool_name).ok_or(ApiError::NotFound)?;
    let params = parse_params(&body)?;
    tools::validate(tool, &params).map_err(ApiError::Validation)?;

    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    let result = ctx.ipc.call(tool.name, params, None).await?;
    Ok(ok_envelope(result))
}
