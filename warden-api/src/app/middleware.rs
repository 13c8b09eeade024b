use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use warden_core::{DeviceInfo, Principal};

use super::error::ApiError;
use super::state::AppState;

/// 认证信息扩展
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub principal: Principal,
}

impl AuthInfo {
    /// 检查是否是管理员
    pub fn is_admin(&self) -> bool {
        self.principal.is_admin()
    }
}

/// 要求管理员权限的 Extractor
#[derive(Debug, Clone)]
pub struct RequireAdmin(#[allow(dead_code)] pub AuthInfo);

impl<S: Send + Sync> FromRequestParts<S> for RequireAdmin {
    type Rejection = ApiError;

    fn from_request_parts<'a, 'b, 'c>(
        parts: &'a mut Parts,
        _state: &'b S,
    ) -> Pin<Box<dyn Future<Output = Result<Self, Self::Rejection>> + Send + 'c>>
    where
        'a: 'c,
        'b: 'c,
    {
        Box::pin(async move {
            let auth = parts
                .extensions
                .get::<AuthInfo>()
                .cloned()
                .ok_or_else(ApiError::unauthorized)?;

            if !auth.is_admin() {
                return Err(ApiError::forbidden("admin access required"));
            }
            Ok(RequireAdmin(auth))
        })
    }
}

/// 设备信息 Extractor：从 User-Agent 与客户端 IP 构造指纹
#[derive(Debug, Clone)]
pub struct DeviceMeta(pub DeviceInfo);

impl<S: Send + Sync> FromRequestParts<S> for DeviceMeta {
    type Rejection = ApiError;

    fn from_request_parts<'a, 'b, 'c>(
        parts: &'a mut Parts,
        _state: &'b S,
    ) -> Pin<Box<dyn Future<Output = Result<Self, Self::Rejection>> + Send + 'c>>
    where
        'a: 'c,
        'b: 'c,
    {
        Box::pin(async move {
            let user_agent = parts
                .headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            let ip = client_ip(
                &parts.headers,
                parts.extensions.get::<ConnectInfo<SocketAddr>>(),
            );
            Ok(DeviceMeta(DeviceInfo::new(user_agent, ip)))
        })
    }
}

/// 不需要认证的路径
const PUBLIC_PATHS: &[&str] = &["/health", "/auth/login", "/auth/refresh"];

/// 从请求中提取 Bearer token
fn extract_token(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

/// 提取客户端 IP
/// 优先级：X-Real-IP > X-Forwarded-For（第一个） > Socket Address
fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    // 1. 优先从 X-Real-IP header 获取（Nginx 常用）
    if let Some(real_ip) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }

    // 2. 从 X-Forwarded-For 获取第一个 IP（最左边是真实客户端）
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first_ip) = forwarded.split(',').next().map(|s| s.trim()) {
            if !first_ip.is_empty() {
                return first_ip.to_string();
            }
        }
    }

    // 3. fallback 到直连 socket 地址
    connect_info
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    // 公开端点不需要认证
    if PUBLIC_PATHS.iter().any(|p| path == *p) {
        return Ok(next.run(request).await);
    }

    let ip = client_ip(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
    );
    let token = match extract_token(&request) {
        Some(token) => token,
        None => {
            // 无 token：计入认证失败限流
            if !state.auth_limiter.allow(&ip) {
                tracing::warn!(ip = %ip, path = %path, "认证限流触发 (无token)");
                return Err(ApiError::too_many_requests(state.auth_limiter.retry_after(&ip)));
            }
            return Err(ApiError::unauthorized());
        }
    };

    // 验证 token 并交叉检查会话撤销状态
    let principal = match state.user_manager.authenticate(&token).await {
        Ok(principal) => principal,
        Err(_) => {
            if !state.auth_limiter.allow(&ip) {
                tracing::warn!(ip = %ip, path = %path, "认证限流触发 (token无效)");
                return Err(ApiError::too_many_requests(state.auth_limiter.retry_after(&ip)));
            }
            return Err(ApiError::unauthorized());
        }
    };

    // 已认证请求不受认证限流影响，直接放行
    request.extensions_mut().insert(AuthInfo { principal });
    Ok(next.run(request).await)
}
