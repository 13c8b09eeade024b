mod app;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use app::{app_router, AppState};
use base64::{engine::general_purpose, Engine};
use dotenvy::dotenv;
use rand::RngCore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::{
    AuditLog, BruteForceGuard, RateLimiter, SessionRegistry, UserManager, DEFAULT_COST,
    DEFAULT_MAX_SESSIONS_PER_USER,
};

/// 会话过期清理周期
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct ApiConfig {
    bind: SocketAddr,
    data_dir: PathBuf,
    /// JWT 签名密钥
    jwt_secret: String,
    /// JWT iss
    jwt_issuer: String,
    /// JWT aud
    jwt_audience: String,
    /// 静态加密主密钥（base64，32 字节）
    master_key: [u8; 32],
    /// Access token 有效期（秒）
    access_token_ttl: i64,
    /// Refresh token 有效期（秒）
    refresh_token_ttl: i64,
    /// 每用户并发会话上限
    max_sessions: usize,
    /// bcrypt cost（只影响新摘要）
    bcrypt_cost: u32,
    /// otpauth URI 的发行方名称
    totp_issuer: String,
    /// 首次启动引导的管理员密码
    bootstrap_admin_password: Option<String>,
    /// CORS 允许的来源列表（空则允许所有）
    cors_origins: Vec<String>,
}

impl ApiConfig {
    fn from_env() -> Self {
        let bind = env::var("WD_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("valid default bind"));

        let data_dir = env::var("WD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let jwt_secret = env::var("WD_JWT_SECRET").unwrap_or_else(|_| {
            info!("WD_JWT_SECRET not set; generating a random secret for this run");
            uuid::Uuid::new_v4().to_string()
        });
        let jwt_issuer = env::var("WD_JWT_ISSUER").unwrap_or_else(|_| "warden-api".into());
        let jwt_audience = env::var("WD_JWT_AUDIENCE").unwrap_or_else(|_| "warden-clients".into());

        // 主密钥丢失意味着所有密文（2FA secret、备份码）不可恢复，
        // 生产环境必须显式配置并妥善备份
        let master_key = match env::var("WD_MASTER_KEY") {
            Ok(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded.trim())
                    .expect("WD_MASTER_KEY must be valid base64");
                bytes
                    .try_into()
                    .expect("WD_MASTER_KEY must decode to exactly 32 bytes")
            }
            Err(_) => {
                warn!(
                    "WD_MASTER_KEY not set; generating an ephemeral master key. \
                     Encrypted secrets will be UNRECOVERABLE after restart."
                );
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };

        let access_token_ttl = env::var("WD_ACCESS_TOKEN_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15 * 60);
        let refresh_token_ttl = env::var("WD_REFRESH_TOKEN_TTL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7 * 24 * 3600);

        let max_sessions = env::var("WD_MAX_SESSIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SESSIONS_PER_USER);

        let bcrypt_cost = env::var("WD_BCRYPT_COST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_COST);

        let totp_issuer = env::var("WD_TOTP_ISSUER").unwrap_or_else(|_| "Warden".into());

        let bootstrap_admin_password = env::var("WD_BOOTSTRAP_ADMIN_PASSWORD")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // CORS 允许的来源，逗号分隔；空或 "*" 表示允许所有
        let cors_origins = env::var("WD_CORS_ORIGINS")
            .ok()
            .map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "*" {
                    vec![]
                } else {
                    trimmed
                        .split(',')
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| t.trim().to_string())
                        .collect()
                }
            })
            .unwrap_or_default();

        Self {
            bind,
            data_dir,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            master_key,
            access_token_ttl,
            refresh_token_ttl,
            max_sessions,
            bcrypt_cost,
            totp_issuer,
            bootstrap_admin_password,
            cors_origins,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 优先读取 .env（若存在）
    let _ = dotenv();
    init_tracing();

    let config = ApiConfig::from_env();
    info!("starting API on {}", config.bind);

    std::fs::create_dir_all(&config.data_dir)?;

    // 审计日志、会话注册表、锁定防护按启动顺序构造一次，再注入用户管理器
    let audit = AuditLog::spawn(&config.data_dir);
    let sessions = Arc::new(
        SessionRegistry::new(&config.data_dir, audit.clone())
            .with_max_sessions(config.max_sessions),
    );
    sessions.ensure_dirs()?;
    let loaded = sessions.load().await?;
    info!(sessions = loaded, "session registry loaded");

    let guard = Arc::new(BruteForceGuard::new(audit.clone()));

    let user_manager = Arc::new(
        UserManager::new(
            config.data_dir.clone(),
            config.jwt_secret.clone(),
            config.master_key,
            sessions.clone(),
            guard.clone(),
            audit.clone(),
        )
        .with_claims_context(config.jwt_issuer.clone(), config.jwt_audience.clone())
        .with_token_ttl(config.access_token_ttl, config.refresh_token_ttl)
        .with_bcrypt_cost(config.bcrypt_cost)
        .with_totp_issuer(config.totp_issuer.clone()),
    );
    user_manager.ensure_dirs()?;

    // 首次启动引导管理员账号
    if let Some(password) = &config.bootstrap_admin_password {
        match user_manager.bootstrap_admin("admin", password).await {
            Ok(Some(_)) => info!("admin user bootstrapped"),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to bootstrap admin user"),
        }
    }

    // 周期性物理清理过期会话（validate 本身是惰性过期，不依赖这里）
    let sweeper = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                tracing::warn!(error = %e, "session sweep failed");
            }
        }
    });

    let state = AppState {
        user_manager,
        sessions,
        audit,
        login_limiter: Arc::new(RateLimiter::new(10, Duration::from_secs(60))),
        refresh_limiter: Arc::new(RateLimiter::new(30, Duration::from_secs(300))),
        auth_limiter: Arc::new(RateLimiter::new(60, Duration::from_secs(60))),
        password_limiter: Arc::new(RateLimiter::new(5, Duration::from_secs(300))),
    };

    let app = app_router(state, config.cors_origins.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
