//! 双因素认证 API handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::error::ApiError;
use super::super::middleware::{AuthInfo, DeviceMeta};
use super::super::state::AppState;

/// 验证码请求体（confirm/disable 共用）
#[derive(Debug, Deserialize)]
pub struct TwoFactorCodeRequest {
    pub code: String,
}

/// POST /auth/2fa/setup - 生成 TOTP secret、otpauth URI 和备份码
///
/// 明文只在本次响应里出现一次，落盘的是密文。
pub async fn setup_2fa(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let response = state
        .user_manager
        .setup_two_factor(&auth.principal.user_id)
        .await?;

    Ok((StatusCode::OK, Json(json!(response))))
}

/// POST /auth/2fa/confirm - 校验首枚验证码并启用 2FA
pub async fn confirm_2fa(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    Json(req): Json<TwoFactorCodeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let confirmed = state
        .user_manager
        .confirm_two_factor(&auth.principal.user_id, &req.code)
        .await?;
    if !confirmed {
        return Err(ApiError::bad_request("验证代码错误"));
    }

    Ok((StatusCode::OK, Json(json!({"enabled": true}))))
}

/// POST /auth/2fa/disable - 禁用 2FA（需要当前有效的验证码或备份码）
pub async fn disable_2fa(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    DeviceMeta(device): DeviceMeta,
    Json(req): Json<TwoFactorCodeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .user_manager
        .disable_two_factor(&auth.principal.user_id, &req.code, &device)
        .await?;

    Ok((StatusCode::OK, Json(json!({"enabled": false}))))
}
