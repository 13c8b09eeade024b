//! 用户与令牌数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// 用户角色
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

/// 用户账户（存储模型，包含密码哈希）
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// 用户唯一 ID (UUID)
    pub id: String,
    /// 用户名（唯一，用于登录）
    pub username: String,
    /// bcrypt 哈希后的密码（cost 内嵌于摘要，调整 cost 不影响旧摘要）
    pub password_hash: String,
    #[serde(default)]
    pub role: UserRole,
    /// 双因素认证注册信息；None 表示从未设置
    pub totp: Option<TwoFactorEnrollment>,
    /// 创建时间
    pub created_at: Option<DateTime<Utc>>,
    /// 更新时间
    pub updated_at: Option<DateTime<Utc>>,
}

/// 2FA 注册状态机：PENDING -> ENABLED -> DISABLED。
/// ENABLED/DISABLED 不会退回 PENDING，重新 setup 生成全新的 PENDING 注册。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotpStatus {
    Pending,
    Enabled,
    Disabled,
}

/// 单个备份码（密文存储，一次性使用）
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    pub code_enc: String,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// 2FA 注册信息；secret 与备份码只以密文落盘
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorEnrollment {
    pub status: TotpStatus,
    pub secret_enc: String,
    #[serde(default)]
    pub backup_codes: Vec<BackupCode>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TwoFactorEnrollment {
    pub fn is_enabled(&self) -> bool {
        self.status == TotpStatus::Enabled
    }
}

/// 创建用户请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: UserRole,
}

/// 更新用户请求
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    /// 新密码（可选）
    pub password: Option<String>,
    /// 新角色（可选）
    pub role: Option<UserRole>,
}

/// Token 类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// 访问 token
    Access,
    /// 刷新 token
    Refresh,
    /// 2FA 挑战 token（只能用于完成登录第二段）
    Challenge,
}

/// JWT Claims 结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: 用户 ID
    pub sub: String,
    /// 用户名
    pub username: String,
    /// JWT issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// JWT audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Token 类型
    pub token_type: TokenType,
    /// 用户角色
    #[serde(default)]
    pub role: UserRole,
    /// 唯一标识（UUIDv4，128 bit），关联会话记录用于撤销检查
    pub jti: String,
    /// 过期时间戳 (Unix timestamp)
    pub exp: i64,
    /// 签发时间戳 (Unix timestamp)
    pub iat: i64,
}

/// 认证响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// Access token (JWT)
    pub access_token: String,
    /// Refresh token (JWT)
    pub refresh_token: String,
    /// Access token 过期时间（秒）
    pub expires_in: i64,
    /// Token 类型
    pub token_type: String,
}

/// 鉴权后的主体：暴露给资源代理等协作方的唯一契约
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
    /// 来源 access token 的 jti
    pub jti: String,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// 登录请求：用户名密码一段式，或挑战令牌 + 验证码二段式
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub challenge_token: Option<String>,
}

/// 刷新请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// 2FA 初始化响应；secret 与备份码的明文只在这里出现一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup2FAResponse {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

/// 用户列表项（不含敏感信息）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub role: UserRole,
    pub two_factor_enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            two_factor_enabled: user.totp.map(|t| t.is_enabled()).unwrap_or(false),
            created_at: user.created_at,
        }
    }
}
