//! 认证相关 API handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use warden_core::{LoginRequest, RefreshRequest};

use super::super::error::ApiError;
use super::super::middleware::{AuthInfo, DeviceMeta};
use super::super::state::AppState;

/// POST /auth/login - 用户登录（支持用户名密码或挑战令牌 + 验证码）
pub async fn login(
    State(state): State<AppState>,
    DeviceMeta(device): DeviceMeta,
    Json(req): Json<LoginRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.login_limiter.allow(&device.ip) {
        return Err(ApiError::too_many_requests(
            state.login_limiter.retry_after(&device.ip),
        ));
    }

    let auth_token = state.user_manager.login(&req, &device).await?;

    Ok((StatusCode::OK, Json(json!(auth_token))))
}

/// POST /auth/refresh - 刷新 token（旧 refresh token 随轮换作废）
pub async fn refresh(
    State(state): State<AppState>,
    DeviceMeta(device): DeviceMeta,
    Json(req): Json<RefreshRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.refresh_limiter.allow(&device.ip) {
        return Err(ApiError::too_many_requests(
            state.refresh_limiter.retry_after(&device.ip),
        ));
    }

    let auth_token = state
        .user_manager
        .refresh(&req.refresh_token, &device)
        .await?;

    Ok((StatusCode::OK, Json(json!(auth_token))))
}

/// 注销请求
#[derive(Debug, Deserialize, Default)]
pub struct LogoutRequest {
    /// true 时注销该用户全部会话
    #[serde(default)]
    pub all: bool,
}

/// POST /auth/logout - 注销当前会话（或全部会话）
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    body: Option<Json<LogoutRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let all = body.map(|Json(req)| req.all).unwrap_or(false);
    let revoked = state.user_manager.logout(&auth.principal, all).await?;

    Ok((StatusCode::OK, Json(json!({"revoked": revoked}))))
}
