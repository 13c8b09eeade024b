//! 令牌签发、验证与登录流程
//!
//! Token 是自校验的三段式 JWT，验证本身不查任何存储；撤销状态由会话
//! 注册表按 jti 交叉检查（见 `authenticate`），两者分工使验证保持
//! 无查找而撤销仍然可用。

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::crypto::verify_password;
use super::models::*;
use super::UserManager;
use crate::audit::{AuditEvent, AuditKind, RiskLevel};
use crate::error::{AuthError, Result};
use crate::session::{DeviceInfo, REASON_LOGOUT, REASON_ROTATED};

impl UserManager {
    /// 用户登录：锁定检查 -> 密码验证 -> （已启用时）2FA -> 签发令牌并注册会话
    #[instrument(skip(self, req, device))]
    pub async fn login(&self, req: &LoginRequest, device: &DeviceInfo) -> Result<AuthToken> {
        // 挑战令牌二段式登录
        if let Some(challenge_token) = &req.challenge_token {
            let code = req.two_factor_code.as_deref().ok_or_else(|| {
                AuthError::PolicyViolation("two_factor_code is required".into())
            })?;
            return self.complete_challenge(challenge_token, code, device).await;
        }

        let username = req
            .username
            .as_deref()
            .ok_or_else(|| AuthError::PolicyViolation("username is required".into()))?;
        let password = req
            .password
            .as_deref()
            .ok_or_else(|| AuthError::PolicyViolation("password is required".into()))?;

        // 被锁定的来源不进入密码比较
        if self.guard.is_blocked(&device.ip) {
            return Err(AuthError::AccountLocked {
                retry_after: self.guard.retry_after(&device.ip),
            });
        }

        let user = self.find_by_username(username).await?;
        // 未知用户也走一次完整哈希比较，保持失败路径耗时一致
        let digest = match &user {
            Some(user) => user.password_hash.clone(),
            None => self.timing_pad_digest().await,
        };
        let password_valid = verify_password(password, &digest).await.unwrap_or(false);

        let user = match user {
            Some(user) if password_valid => user,
            _ => {
                self.guard.record_failure(&device.ip);
                warn!(username = %username, ip = %device.ip, "login failed: invalid credentials");
                self.audit.append(
                    AuditEvent::new(AuditKind::LoginFailed, RiskLevel::Medium)
                        .with_client(&device.ip, &device.user_agent)
                        .with_detail(json!({
                            "username": username,
                            "reason": "invalid_credentials",
                        })),
                );
                return Err(AuthError::InvalidCredentials);
            }
        };

        // 已启用 2FA：要求验证码，否则发放挑战令牌
        if user.totp.as_ref().map(|t| t.is_enabled()).unwrap_or(false) {
            match req.two_factor_code.as_deref() {
                None => {
                    let challenge_token = self.mint_challenge(&user)?;
                    return Err(AuthError::TwoFactorRequired { challenge_token });
                }
                Some(code) => {
                    if !self.verify_two_factor(&user.id, code, device).await? {
                        // 2FA 失败与密码失败共享同一份锁定预算
                        self.guard.record_failure(&device.ip);
                        return Err(AuthError::TwoFactorInvalid);
                    }
                }
            }
        }

        info!(user_id = %user.id, username = %user.username, "user logged in");
        let token = self.issue_tokens(&user, device).await?;
        self.audit.append(
            AuditEvent::new(AuditKind::LoginSuccess, RiskLevel::Low)
                .with_user(&user.id)
                .with_client(&device.ip, &device.user_agent),
        );
        Ok(token)
    }

    /// 以挑战令牌完成登录第二段（密码已在第一段验证过）
    #[instrument(skip(self, challenge_token, code, device))]
    pub async fn complete_challenge(
        &self,
        challenge_token: &str,
        code: &str,
        device: &DeviceInfo,
    ) -> Result<AuthToken> {
        if self.guard.is_blocked(&device.ip) {
            return Err(AuthError::AccountLocked {
                retry_after: self.guard.retry_after(&device.ip),
            });
        }

        let claims = self.verify_token(challenge_token)?;
        if claims.token_type != TokenType::Challenge {
            return Err(AuthError::TokenMalformed);
        }
        let user = self.get_user(&claims.sub).await?;

        if !self.verify_two_factor(&user.id, code, device).await? {
            self.guard.record_failure(&device.ip);
            return Err(AuthError::TwoFactorInvalid);
        }

        info!(user_id = %user.id, "challenge completed, user logged in");
        let token = self.issue_tokens(&user, device).await?;
        self.audit.append(
            AuditEvent::new(AuditKind::LoginSuccess, RiskLevel::Low)
                .with_user(&user.id)
                .with_client(&device.ip, &device.user_agent),
        );
        Ok(token)
    }

    /// 刷新令牌轮换：被出示的 refresh jti 随旧会话一并撤销，
    /// 轮换后重放旧 refresh token 会以 TokenRevoked 失败。
    #[instrument(skip(self, refresh_token, device))]
    pub async fn refresh(&self, refresh_token: &str, device: &DeviceInfo) -> Result<AuthToken> {
        let claims = self.verify_token(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::TokenMalformed);
        }

        let session = self
            .sessions
            .get_by_refresh(&claims.jti)
            .await
            .ok_or(AuthError::TokenRevoked)?;
        if session.revoked || session.is_expired() {
            return Err(AuthError::TokenRevoked);
        }

        let user = self.get_user(&claims.sub).await?;
        self.sessions.revoke(&session.jti, REASON_ROTATED).await?;

        let token = self.issue_tokens(&user, device).await?;
        info!(user_id = %user.id, "token refreshed");
        self.audit.append(
            AuditEvent::new(AuditKind::TokenRefreshed, RiskLevel::Low)
                .with_user(&user.id)
                .with_client(&device.ip, &device.user_agent),
        );
        Ok(token)
    }

    /// 生成 access/refresh token 对并注册会话（绑定 access jti）
    pub(super) async fn issue_tokens(&self, user: &User, device: &DeviceInfo) -> Result<AuthToken> {
        let now = Utc::now();
        let jti = Uuid::new_v4().to_string();
        let refresh_jti = Uuid::new_v4().to_string();

        let access_claims = TokenClaims {
            sub: user.id.clone(),
            username: user.username.clone(),
            iss: Some(self.jwt_issuer.clone()),
            aud: Some(self.jwt_audience.clone()),
            token_type: TokenType::Access,
            role: user.role,
            jti: jti.clone(),
            exp: (now + Duration::seconds(self.access_token_ttl)).timestamp(),
            iat: now.timestamp(),
        };
        let refresh_claims = TokenClaims {
            sub: user.id.clone(),
            username: user.username.clone(),
            iss: Some(self.jwt_issuer.clone()),
            aud: Some(self.jwt_audience.clone()),
            token_type: TokenType::Refresh,
            role: user.role,
            jti: refresh_jti.clone(),
            exp: (now + Duration::seconds(self.refresh_token_ttl)).timestamp(),
            iat: now.timestamp(),
        };

        let access_token = self.encode_claims(&access_claims)?;
        let refresh_token = self.encode_claims(&refresh_claims)?;

        // 会话有效期与 refresh token 对齐；超出并发上限时最旧会话被驱逐
        self.sessions
            .create(
                &user.id,
                &jti,
                &refresh_jti,
                device.clone(),
                Duration::seconds(self.refresh_token_ttl),
            )
            .await?;

        Ok(AuthToken {
            access_token,
            refresh_token,
            expires_in: self.access_token_ttl,
            token_type: "Bearer".to_string(),
        })
    }

    /// 签发 2FA 挑战令牌（短时效，不注册会话，只能用于完成登录第二段）
    fn mint_challenge(&self, user: &User) -> Result<String> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: user.id.clone(),
            username: user.username.clone(),
            iss: Some(self.jwt_issuer.clone()),
            aud: Some(self.jwt_audience.clone()),
            token_type: TokenType::Challenge,
            role: user.role,
            jti: Uuid::new_v4().to_string(),
            exp: (now + Duration::seconds(self.challenge_token_ttl)).timestamp(),
            iat: now.timestamp(),
        };
        self.encode_claims(&claims)
    }

    fn encode_claims(&self, claims: &TokenClaims) -> Result<String> {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Other(format!("token encoding failed: {}", e)))
    }

    /// 验证 JWT（无状态，不查撤销；撤销检查见 `authenticate`）
    pub fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::default();
        validation.set_audience(&[self.jwt_audience.clone()]);
        validation.set_issuer(&[self.jwt_issuer.clone()]);
        let token_data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidSignature => AuthError::TokenSignatureInvalid,
            _ => AuthError::TokenMalformed,
        })?;
        Ok(token_data.claims)
    }

    /// 协作方唯一契约：校验 bearer token 并交叉检查会话状态。
    /// 资源代理等协作方只调用这一个入口，自己不做任何会话/2FA 逻辑。
    pub async fn authenticate(&self, bearer: &str) -> Result<Principal> {
        let claims = self.verify_token(bearer)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::TokenMalformed);
        }
        // 无状态验证之外的撤销检查：jti 必须对应一个活跃会话
        match self.sessions.validate(&claims.jti).await {
            Some(_) => Ok(Principal {
                user_id: claims.sub,
                username: claims.username,
                role: claims.role,
                jti: claims.jti,
            }),
            None => Err(AuthError::TokenRevoked),
        }
    }

    /// 注销当前会话；all=true 时注销该用户全部会话。返回撤销数量。
    #[instrument(skip(self, principal))]
    pub async fn logout(&self, principal: &Principal, all: bool) -> Result<usize> {
        let count = if all {
            self.sessions
                .revoke_all(&principal.user_id, REASON_LOGOUT)
                .await?
        } else {
            self.sessions.revoke(&principal.jti, REASON_LOGOUT).await?;
            1
        };
        info!(user_id = %principal.user_id, all, "logged out");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::test_support::manager;
    use super::*;
    use crate::session::REASON_MAX_SESSIONS;
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo::new("test-agent", "10.0.0.1")
    }

    fn login_req(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            two_factor_code: None,
            challenge_token: None,
        }
    }

    async fn setup_user(manager: &UserManager, username: &str) -> User {
        manager
            .create_user(CreateUserRequest {
                username: username.to_string(),
                password: "S3cure-pass".to_string(),
                role: UserRole::User,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn login_returns_verifiable_token_pair() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = setup_user(&manager, "alice").await;

        let token = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap();
        assert_eq!(token.token_type, "Bearer");

        let claims = manager.verify_token(&token.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.token_type, TokenType::Access);
        assert!(!claims.jti.is_empty());

        let principal = manager.authenticate(&token.access_token).await.unwrap();
        assert_eq!(principal.user_id, user.id);
        assert_eq!(principal.jti, claims.jti);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_fail_the_same_way() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        setup_user(&manager, "alice").await;

        let wrong = manager
            .login(&login_req("alice", "Wrong-pass1"), &device())
            .await
            .unwrap_err();
        let unknown = manager
            .login(&login_req("nobody", "S3cure-pass"), &device())
            .await
            .unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_source_even_with_correct_password() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        setup_user(&manager, "alice").await;

        for _ in 0..5 {
            let _ = manager
                .login(&login_req("alice", "Wrong-pass1"), &device())
                .await;
        }
        // 第 6 次即便密码正确也被锁定拒绝
        let err = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked { .. }));
    }

    #[tokio::test]
    async fn expired_access_token_fails_with_token_expired() {
        let dir = TempDir::new().unwrap();
        // leeway 默认 60s，这里直接把有效期拨到足够远的过去
        let manager = manager(&dir).with_token_ttl(-300, 3600);
        setup_user(&manager, "alice").await;

        let token = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap();
        let err = manager.verify_token(&token.access_token).unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn tampered_token_fails_signature_check() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        setup_user(&manager, "alice").await;

        let token = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap();
        let mut forged = token.access_token.clone();
        forged.truncate(forged.len() - 2);
        forged.push_str("xx");
        let err = manager.verify_token(&forged).unwrap_err();
        assert!(matches!(
            err,
            AuthError::TokenSignatureInvalid | AuthError::TokenMalformed
        ));

        assert!(matches!(
            manager.verify_token("not-a-jwt").unwrap_err(),
            AuthError::TokenMalformed
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_and_replay_is_revoked() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        setup_user(&manager, "alice").await;

        let first = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap();
        let second = manager
            .refresh(&first.refresh_token, &device())
            .await
            .unwrap();
        assert_ne!(first.access_token, second.access_token);

        // 旧 access token 随轮换一并失效
        assert!(matches!(
            manager.authenticate(&first.access_token).await.unwrap_err(),
            AuthError::TokenRevoked
        ));
        // 重放旧 refresh token
        assert!(matches!(
            manager.refresh(&first.refresh_token, &device()).await.unwrap_err(),
            AuthError::TokenRevoked
        ));
        // 新对仍然可用
        manager.authenticate(&second.access_token).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_does_not_accept_access_tokens() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        setup_user(&manager, "alice").await;

        let token = manager
            .login(&login_req("alice", "S3cure-pass"), &device())
            .await
            .unwrap();
        assert!(matches!(
            manager.refresh(&token.access_token, &device()).await.unwrap_err(),
            AuthError::TokenMalformed
        ));
    }

    #[tokio::test]
    async fn fourth_login_evicts_the_oldest_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = setup_user(&manager, "alice").await;

        let first = manager
            .login(&login_req("alice", "S3cure-pass"), &DeviceInfo::new("d1", "10.0.0.1"))
            .await
            .unwrap();
        for ip in ["10.0.0.2", "10.0.0.3", "10.0.0.4"] {
            manager
                .login(&login_req("alice", "S3cure-pass"), &DeviceInfo::new("d", ip))
                .await
                .unwrap();
        }

        assert_eq!(manager.sessions().active_count(&user.id).await, 3);
        let first_claims = manager.verify_token(&first.access_token).unwrap();
        let evicted = manager.sessions().get(&first_claims.jti).await.unwrap();
        assert!(evicted.revoked);
        assert_eq!(evicted.revoked_reason.as_deref(), Some(REASON_MAX_SESSIONS));
    }

    #[tokio::test]
    async fn logout_revokes_current_or_all_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = setup_user(&manager, "alice").await;

        let a = manager
            .login(&login_req("alice", "S3cure-pass"), &DeviceInfo::new("d1", "10.0.0.1"))
            .await
            .unwrap();
        let b = manager
            .login(&login_req("alice", "S3cure-pass"), &DeviceInfo::new("d2", "10.0.0.2"))
            .await
            .unwrap();

        let principal = manager.authenticate(&a.access_token).await.unwrap();
        manager.logout(&principal, false).await.unwrap();
        assert!(manager.authenticate(&a.access_token).await.is_err());
        manager.authenticate(&b.access_token).await.unwrap();

        let principal_b = manager.authenticate(&b.access_token).await.unwrap();
        manager.logout(&principal_b, true).await.unwrap();
        assert_eq!(manager.sessions().active_count(&user.id).await, 0);
    }
}
