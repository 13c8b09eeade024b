use thiserror::Error;

/// Common result type for core operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked, retry after {retry_after}s")]
    AccountLocked { retry_after: u64 },
    #[error("token expired")]
    TokenExpired,
    #[error("token malformed")]
    TokenMalformed,
    #[error("token signature invalid")]
    TokenSignatureInvalid,
    #[error("token revoked")]
    TokenRevoked,
    #[error("two-factor code required")]
    TwoFactorRequired { challenge_token: String },
    #[error("two-factor code invalid")]
    TwoFactorInvalid,
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },
    #[error("encryption failure: {0}")]
    EncryptionFailure(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("other error: {0}")]
    Other(String),
}
