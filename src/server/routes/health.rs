use crate::ipc::BrowserState;
use crate::AppContext;
use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /health` — the one route that needs no auth and no browser. Reports
/// gateway liveness plus the browser state machine so operators can tell
/// "gateway down" from "browser down".
pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let mut body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "browser_state": ctx.ipc.state().as_str(),
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
    });
    if ctx.ipc.state() == BrowserState::LicenseError {
        if let Some(lic) = ctx.ipc.license_status() {
            body["license"] = json!({
                "status": lic.status,
                "message": lic.message,
                "fingerprint": lic.fingerprint,
            });
        }
    }
    Json(body)
}
