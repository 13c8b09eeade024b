//! 密码管理：验证强度、修改密码

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use super::crypto::{hash_password, verify_password};
use super::models::User;
use super::UserManager;
use crate::audit::{AuditEvent, AuditKind, RiskLevel};
use crate::error::{AuthError, Result};
use crate::session::REASON_PASSWORD_CHANGED;

impl UserManager {
    /// 验证密码强度
    pub(super) fn validate_password_strength(password: &str) -> Result<()> {
        if password.len() < 8 {
            return Err(AuthError::PolicyViolation(
                "密码长度至少为 8 个字符".into(),
            ));
        }
        let mut has_upper = false;
        let mut has_lower = false;
        let mut has_digit = false;
        let mut has_symbol = false;
        for ch in password.chars() {
            if ch.is_ascii_uppercase() {
                has_upper = true;
            } else if ch.is_ascii_lowercase() {
                has_lower = true;
            } else if ch.is_ascii_digit() {
                has_digit = true;
            } else {
                has_symbol = true;
            }
        }
        if !(has_upper && has_lower && (has_digit || has_symbol)) {
            return Err(AuthError::PolicyViolation(
                "密码必须包含大写字母、小写字母以及数字或符号".into(),
            ));
        }
        Ok(())
    }

    /// 修改用户密码，可选择强制修改（管理员）。
    ///
    /// 成功后撤销该用户全部既有会话；2FA 注册保持不变——移除第二因素
    /// 只能走 `disable_two_factor`，改密不会悄悄削弱账户防护。
    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        id: &str,
        current_password: Option<&str>,
        new_password: &str,
        force: bool,
    ) -> Result<User> {
        let mut user = self.get_user(id).await?;

        Self::validate_password_strength(new_password)?;
        // 校验旧密码（非强制模式）
        if !force {
            let current = current_password
                .ok_or_else(|| AuthError::PolicyViolation("需要输入当前密码".into()))?;
            let valid = verify_password(current, &user.password_hash).await?;
            if !valid {
                return Err(AuthError::InvalidCredentials);
            }
        }

        user.password_hash = hash_password(new_password, self.bcrypt_cost).await?;
        user.updated_at = Some(Utc::now());
        self.persist_user(&user)?;

        let revoked = self
            .sessions
            .revoke_all(&user.id, REASON_PASSWORD_CHANGED)
            .await?;
        self.audit.append(
            AuditEvent::new(AuditKind::PasswordChanged, RiskLevel::Medium)
                .with_user(&user.id)
                .with_detail(json!({"sessions_revoked": revoked, "forced": force})),
        );

        info!(user_id = %id, "password changed");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::test_support::manager;
    use super::super::models::{CreateUserRequest, LoginRequest, UserRole};
    use super::*;
    use crate::session::DeviceInfo;
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo::new("test-agent", "10.0.0.1")
    }

    #[tokio::test]
    async fn change_password_requires_the_current_one() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager
            .create_user(CreateUserRequest {
                username: "alice".into(),
                password: "S3cure-pass".into(),
                role: UserRole::User,
            })
            .await
            .unwrap();

        let err = manager
            .change_password(&user.id, Some("Wrong-pass1"), "N3w-secret!", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        manager
            .change_password(&user.id, Some("S3cure-pass"), "N3w-secret!", false)
            .await
            .unwrap();
        let updated = manager.get_user(&user.id).await.unwrap();
        assert!(
            super::super::crypto::verify_password("N3w-secret!", &updated.password_hash)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn admin_force_change_skips_current_password() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager
            .create_user(CreateUserRequest {
                username: "alice".into(),
                password: "S3cure-pass".into(),
                role: UserRole::User,
            })
            .await
            .unwrap();

        manager
            .change_password(&user.id, None, "N3w-secret!", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn change_password_revokes_existing_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager
            .create_user(CreateUserRequest {
                username: "alice".into(),
                password: "S3cure-pass".into(),
                role: UserRole::User,
            })
            .await
            .unwrap();

        let token = manager
            .login(
                &LoginRequest {
                    username: Some("alice".into()),
                    password: Some("S3cure-pass".into()),
                    two_factor_code: None,
                    challenge_token: None,
                },
                &device(),
            )
            .await
            .unwrap();
        manager.authenticate(&token.access_token).await.unwrap();

        manager
            .change_password(&user.id, Some("S3cure-pass"), "N3w-secret!", false)
            .await
            .unwrap();
        assert!(matches!(
            manager.authenticate(&token.access_token).await.unwrap_err(),
            AuthError::TokenRevoked
        ));
        assert_eq!(manager.sessions().active_count(&user.id).await, 0);
    }
}
