use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// GET /health - 健康检查（无需认证）
pub async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
