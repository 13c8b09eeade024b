use axum::http::{header, HeaderValue, Method};
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::handlers::{
    change_password, confirm_2fa, create_user, delete_user, disable_2fa, get_user, health,
    list_sessions, list_users, login, logout, refresh, revoke_all_sessions, revoke_session,
    setup_2fa, update_user,
};
use super::middleware::auth_middleware;
use super::state::AppState;

/// 根据配置的来源列表构建 CorsLayer
fn build_cors_layer(cors_origins: Vec<String>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ])
        .allow_credentials(true);

    if cors_origins.is_empty() {
        // 未配置时允许所有来源（开发环境友好，生产环境应配置 WD_CORS_ORIGINS）
        tracing::warn!(
            "WD_CORS_ORIGINS not configured, allowing all origins. \
             Set WD_CORS_ORIGINS in production for security."
        );
        base.allow_origin(AllowOrigin::any())
            .allow_credentials(false) // any() 不能与 credentials(true) 共用
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .into_iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        base.allow_origin(origins)
    }
}

/// Build the router with routes and middleware wired.
pub fn app_router(state: AppState, cors_origins: Vec<String>) -> Router {
    // 公开端点（不需要认证）
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh));

    // 认证自助端点
    let auth_routes = Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/2fa/setup", post(setup_2fa))
        .route("/auth/2fa/confirm", post(confirm_2fa))
        .route("/auth/2fa/disable", post(disable_2fa));

    // 会话自助端点
    let session_routes = Router::new()
        .route("/sessions", get(list_sessions).delete(revoke_all_sessions))
        .route("/sessions/:jti", delete(revoke_session));

    // 用户管理端点（需要管理员权限，由 handler 中的 RequireAdmin extractor 检查）
    let admin_routes = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        );

    // 密码更新（认证 + 自己或管理员）
    let password_routes = Router::new().route("/users/:id/password", post(change_password));

    Router::new()
        .merge(public_routes)
        .merge(auth_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .merge(password_routes)
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(build_cors_layer(cors_origins))
        .with_state(state)
}
