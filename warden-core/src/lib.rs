//! Core library for authentication: credentials, tokens, sessions, 2FA,
//! rate limiting and the security audit trail.

mod audit;
mod error;
mod lockout;
mod session;
mod throttle;
pub mod user;

pub use audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, AuditSummary, RiskLevel};
pub use error::{AuthError, Result};
pub use lockout::BruteForceGuard;
pub use session::{
    DeviceInfo, Session, SessionRegistry, SessionSummary, DEFAULT_MAX_SESSIONS_PER_USER,
    REASON_LOGOUT, REASON_MAX_SESSIONS, REASON_PASSWORD_CHANGED, REASON_ROTATED,
};
pub use throttle::RateLimiter;
pub use user::{
    AuthToken, CreateUserRequest, LoginRequest, Principal, RefreshRequest, SecretCipher,
    Setup2FAResponse, TokenClaims, TokenType, TotpStatus, UpdateUserRequest, User, UserManager,
    UserRole, UserSummary, DEFAULT_COST,
};
