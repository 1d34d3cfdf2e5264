use crate::server::routes::ok_envelope;
use crate::AppContext;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /stats` — coherent counter snapshot across every component.
pub async fn stats(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let rl = ctx.rate_limiter.stats();
    ok_envelope(json!({
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
        "server": ctx.stats.snapshot(),
        "ipc": ctx.ipc.stats(),
        "rate_limit": {
            "enabled": ctx.rate_limiter.is_enabled(),
            "total_checks": rl.total_checks,
            "allowed": rl.allowed,
            "denied": rl.denied,
            "tracked_ips": rl.tracked_ips,
        },
        "websocket": {
            "active_connections": ctx.ws_hub.active_count(),
        },
        "video": ctx.video.list(),
    }))
}
