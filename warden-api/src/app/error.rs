use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use warden_core::AuthError;

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    /// 429/423 的重试提示（秒），同时写入 Retry-After 头
    retry_after: Option<u64>,
    /// TwoFactorRequired 专用：登录第二段的挑战令牌
    challenge_token: Option<String>,
}

impl ApiError {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
            retry_after: None,
            challenge_token: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new("Unauthorized", StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("Forbidden", StatusCode::FORBIDDEN, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BadRequest", StatusCode::BAD_REQUEST, message)
    }

    pub fn too_many_requests(retry_after: Option<u64>) -> Self {
        let mut err = Self::new(
            "RateLimitExceeded",
            StatusCode::TOO_MANY_REQUESTS,
            "too many requests, try again later",
        );
        err.retry_after = retry_after;
        err
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            // 认证类失败统一折叠为同一个 401，不区分具体原因（防账号枚举）；
            // 真实原因只进审计日志
            AuthError::InvalidCredentials
            | AuthError::TwoFactorInvalid
            | AuthError::TokenExpired
            | AuthError::TokenMalformed
            | AuthError::TokenSignatureInvalid
            | AuthError::TokenRevoked => ApiError::unauthorized(),
            AuthError::TwoFactorRequired { challenge_token } => {
                let mut e = ApiError::new(
                    "TwoFactorRequired",
                    StatusCode::UNAUTHORIZED,
                    "two-factor code required",
                );
                e.challenge_token = Some(challenge_token);
                e
            }
            AuthError::AccountLocked { retry_after } => {
                let mut e = ApiError::new(
                    "AccountLocked",
                    StatusCode::LOCKED,
                    "account locked, try again later",
                );
                e.retry_after = Some(retry_after);
                e
            }
            AuthError::RateLimitExceeded { retry_after } => {
                ApiError::too_many_requests(Some(retry_after))
            }
            AuthError::NotFound(id) => {
                ApiError::new("NotFound", StatusCode::NOT_FOUND, format!("{id} not found"))
            }
            AuthError::AlreadyExists(id) => ApiError::new(
                "AlreadyExists",
                StatusCode::CONFLICT,
                format!("{id} already exists"),
            ),
            AuthError::PolicyViolation(msg) => {
                ApiError::new("PolicyViolation", StatusCode::BAD_REQUEST, msg)
            }
            // 存储/加密/内部错误：细节进日志，不出现在响应里
            AuthError::EncryptionFailure(msg)
            | AuthError::StoreUnavailable(msg)
            | AuthError::Other(msg) => {
                tracing::error!(error = %msg, "internal error");
                ApiError::new("Error", StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
            AuthError::Io(e) => {
                tracing::error!(error = %e, "io error");
                ApiError::new("Error", StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
            AuthError::Serde(e) => {
                tracing::error!(error = %e, "serde error");
                ApiError::new("Error", StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(retry_after) = self.retry_after {
            body["retry_after"] = json!(retry_after);
        }
        if let Some(challenge_token) = &self.challenge_token {
            body["challenge_token"] = json!(challenge_token);
        }

        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
