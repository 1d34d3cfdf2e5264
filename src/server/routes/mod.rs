pub mod command;
pub mod health;
pub mod stats;
pub mod tools;
pub mod video;

use axum::Json;
use serde_json::{json, Value};

/// The success envelope every command-style route returns.
pub fn ok_envelope(data: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "status": 200,
        "data": data,
    }))
}
