use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

// ─── IPC errors ──────────────────────────────────────────────────────────────

/// Errors surfaced by the browser IPC multiplexer.
///
/// Every pending command completes with exactly one of these (or a result).
/// The variants are distinct on purpose — the router maps each to its own
/// HTTP status and clients are expected to branch on them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("browser command timed out")]
    Timeout,
    #[error("browser command cancelled")]
    Cancelled,
    #[error("browser process exited with commands in flight")]
    BrowserCrashed,
    #[error("browser is not ready (state: {0})")]
    NotReady(String),
    #[error("browser IPC is stopped")]
    Stopped,
    #[error("browser license error: {status}: {message}")]
    License {
        status: String,
        message: String,
        fingerprint: String,
    },
    /// Error object reported by the browser in a reply line.
    #[error("browser error {code}: {message}")]
    Browser { code: i64, message: String },
    #[error("IPC protocol error: {0}")]
    Protocol(String),
    #[error("IPC outbound queue is full")]
    QueueFull,
}

// ─── HTTP API errors ─────────────────────────────────────────────────────────

/// A single parameter-validation failure, reported field by field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Tagged request-handling error. Handlers return this; the response layer
/// maps each tag to a status code and the `{success:false, status, error}`
/// envelope. Internal details never leak: `Internal` always renders the
/// same opaque body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("rate limited")]
    RateLimited {
        retry_after: u64,
        limit: u64,
        reset_at: i64,
    },
    #[error("browser command timed out")]
    UpstreamTimeout,
    /// Browser process is down. `restarting` selects 503 (come back soon)
    /// over 502 (gateway cannot help you).
    #[error("browser unavailable")]
    BrowserUnavailable { restarting: bool },
    #[error("license error: {status}")]
    License {
        status: String,
        message: String,
        fingerprint: String,
    },
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            // Stopped and crashed-but-restarting both read as "come back
            // soon"; only the body distinguishes them.
            ApiError::BrowserUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::License { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the `error` member of the response envelope.
    fn error_body(&self) -> serde_json::Value {
        match self {
            ApiError::BadRequest(msg) => json!(msg),
            ApiError::PayloadTooLarge => json!("Request body too large"),
            ApiError::Unauthorized(msg) => json!(msg),
            ApiError::Forbidden(msg) => json!(msg),
            ApiError::NotFound => json!("Not found"),
            ApiError::MethodNotAllowed => json!("Method not allowed"),
            ApiError::Validation(fields) => json!({
                "message": "Parameter validation failed",
                "fields": fields,
            }),
            ApiError::RateLimited {
                retry_after,
                limit,
                reset_at,
            } => json!({
                "message": "Rate limit exceeded",
                "retry_after": retry_after,
                "limit": limit,
                "reset_at": reset_at,
            }),
            ApiError::UpstreamTimeout => json!("timeout"),
            ApiError::BrowserUnavailable { restarting } => {
                if *restarting {
                    json!("Browser crashed and is restarting")
                } else {
                    json!("Browser is not running")
                }
            }
            ApiError::License {
                status,
                message,
                fingerprint,
            } => json!({
                "license_status": status,
                "message": message,
                "fingerprint": fingerprint,
            }),
            ApiError::Internal => json!("Internal error"),
        }
    }
}

impl From<IpcError> for ApiError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Timeout => ApiError::UpstreamTimeout,
            IpcError::Cancelled => ApiError::BadRequest("command cancelled".into()),
            IpcError::BrowserCrashed => ApiError::BrowserUnavailable { restarting: true },
            IpcError::NotReady(_) | IpcError::Stopped => {
                ApiError::BrowserUnavailable { restarting: false }
            }
            IpcError::License {
                status,
                message,
                fingerprint,
            } => ApiError::License {
                status,
                message,
                fingerprint,
            },
            IpcError::Browser { message, .. } => ApiError::BadRequest(message),
            IpcError::Protocol(_) | IpcError::QueueFull => ApiError::Internal,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "success": false,
            "status": status.as_u16(),
            "error": self.error_body(),
        });
        let mut resp = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after, .. } = &self {
            if let Ok(v) = retry_after.to_string().parse() {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}
