use std::sync::Arc;
use warden_core::{AuditLog, RateLimiter, SessionRegistry, UserManager};

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub user_manager: Arc<UserManager>,
    pub sessions: Arc<SessionRegistry>,
    pub audit: AuditLog,
    /// 登录接口限流（按 IP）
    pub login_limiter: Arc<RateLimiter>,
    /// 刷新接口限流（按 IP）
    pub refresh_limiter: Arc<RateLimiter>,
    /// Token 认证失败限流（按 IP）
    pub auth_limiter: Arc<RateLimiter>,
    /// 密码修改限流（按用户 ID，防止暴力破解当前密码）
    pub password_limiter: Arc<RateLimiter>,
}
