//! 会话自助管理 API handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::{json, Value};
use warden_core::{SessionSummary, REASON_LOGOUT};

use super::super::error::ApiError;
use super::super::middleware::AuthInfo;
use super::super::state::AppState;

/// GET /sessions - 当前用户的活跃会话列表
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state.sessions.list_active(&auth.principal.user_id).await;
    let summaries: Vec<SessionSummary> = sessions.iter().map(SessionSummary::from).collect();
    Ok(Json(summaries))
}

/// DELETE /sessions/:jti - 撤销单个会话（本人或管理员）
pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    Path(jti): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let session = state
        .sessions
        .get(&jti)
        .await
        .ok_or_else(|| ApiError::new("NotFound", StatusCode::NOT_FOUND, "session not found"))?;

    if session.user_id != auth.principal.user_id && !auth.is_admin() {
        return Err(ApiError::forbidden("cannot revoke other users' sessions"));
    }

    state.sessions.revoke(&jti, REASON_LOGOUT).await?;
    Ok((StatusCode::OK, Json(json!({"revoked": true}))))
}

/// DELETE /sessions - 撤销当前用户全部会话
pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let revoked = state
        .sessions
        .revoke_all(&auth.principal.user_id, REASON_LOGOUT)
        .await?;
    Ok((StatusCode::OK, Json(json!({"revoked": revoked}))))
}
