//! 用户认证与授权模块

mod auth;
mod crypto;
mod encryption;
mod manager;
mod models;
mod password;
mod totp;

pub use crypto::DEFAULT_COST;
pub use encryption::SecretCipher;
pub use manager::UserManager;
pub use models::{
    AuthToken, CreateUserRequest, LoginRequest, Principal, RefreshRequest, Setup2FAResponse,
    TokenClaims, TokenType, TotpStatus, TwoFactorEnrollment, UpdateUserRequest, User, UserRole,
    UserSummary,
};
