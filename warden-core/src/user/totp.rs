//! TOTP 双因素认证：注册、确认、验证与备份码
//!
//! 基于 RFC 6238，±1 步（30 秒）容差。secret 与备份码经 `SecretCipher`
//! 加密落盘，明文只在 setup 响应里出现一次；备份码一次性使用，消费
//! 标记在持有用户锁的情况下先持久化再放行。

use chrono::Utc;
use rand::{Rng, RngCore};
use serde_json::json;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, instrument, warn};

use super::models::*;
use super::UserManager;
use crate::audit::{AuditEvent, AuditKind, RiskLevel};
use crate::error::{AuthError, Result};
use crate::session::DeviceInfo;

const BACKUP_CODE_COUNT: usize = 10;
// 排除易混淆字符 (0, O, I, L, 1)
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// 生成备份码（格式: ABCD-2345）
fn generate_backup_code() -> String {
    let mut rng = rand::thread_rng();
    let part1: String = (0..4)
        .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
        .collect();
    let part2: String = (0..4)
        .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", part1, part2)
}

fn build_totp(secret_bytes: Vec<u8>) -> Result<TOTP> {
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret_bytes)
        .map_err(|e| AuthError::Other(format!("TOTP creation failed: {}", e)))
}

impl UserManager {
    /// 初始化 2FA：生成 secret、otpauth URI 和备份码（第一步）。
    /// 注册以 PENDING 状态落盘，重复调用会整体替换旧注册。
    #[instrument(skip(self))]
    pub async fn setup_two_factor(&self, user_id: &str) -> Result<Setup2FAResponse> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut user = self.get_user(user_id).await?;

        // 160-bit secret（RFC 4226 推荐长度）
        let mut secret_bytes = vec![0u8; 20];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret_base32 = Secret::Raw(secret_bytes).to_encoded().to_string();

        // 手动构造 otpauth URL
        let provisioning_uri = format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}",
            issuer = urlencoding::encode(&self.totp_issuer),
            account = urlencoding::encode(&user.username),
            secret = secret_base32,
        );

        let backup_codes: Vec<String> = (0..BACKUP_CODE_COUNT)
            .map(|_| generate_backup_code())
            .collect();

        // 密文落盘，密钥按用户派生
        let secret_enc = self.cipher.encrypt(&user.id, secret_base32.as_bytes())?;
        let mut encrypted_codes = Vec::with_capacity(backup_codes.len());
        for code in &backup_codes {
            encrypted_codes.push(BackupCode {
                code_enc: self.cipher.encrypt(&user.id, code.as_bytes())?,
                consumed_at: None,
            });
        }

        user.totp = Some(TwoFactorEnrollment {
            status: TotpStatus::Pending,
            secret_enc,
            backup_codes: encrypted_codes,
            verified_at: None,
            created_at: Utc::now(),
        });
        user.updated_at = Some(Utc::now());
        self.persist_user(&user)?;

        info!(user_id = %user.id, "2FA setup initiated");
        self.audit.append(
            AuditEvent::new(AuditKind::TwoFactorSetup, RiskLevel::Low).with_user(&user.id),
        );

        Ok(Setup2FAResponse {
            secret: secret_base32,
            provisioning_uri,
            backup_codes,
        })
    }

    /// 确认启用（第二步）：校验首枚验证码，PENDING -> ENABLED。
    /// 失败时注册保持 PENDING，调用方重新提交即可。
    #[instrument(skip(self, code))]
    pub async fn confirm_two_factor(&self, user_id: &str, code: &str) -> Result<bool> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut user = self.get_user(user_id).await?;

        let enrollment = user
            .totp
            .clone()
            .ok_or_else(|| AuthError::PolicyViolation("双因素认证尚未初始化".into()))?;
        match enrollment.status {
            TotpStatus::Enabled => return Ok(true),
            TotpStatus::Disabled => {
                return Err(AuthError::PolicyViolation(
                    "双因素认证已禁用，需要重新初始化".into(),
                ));
            }
            TotpStatus::Pending => {}
        }

        let secret = self.cipher.decrypt_string(&user.id, &enrollment.secret_enc)?;
        let secret_bytes = Secret::Encoded(secret)
            .to_bytes()
            .map_err(|e| AuthError::Other(format!("TOTP secret invalid: {}", e)))?;
        let totp = build_totp(secret_bytes)?;

        let valid = totp.check_current(code).unwrap_or(false);
        if valid {
            if let Some(enrollment) = user.totp.as_mut() {
                enrollment.status = TotpStatus::Enabled;
                enrollment.verified_at = Some(Utc::now());
            }
            user.updated_at = Some(Utc::now());
            self.persist_user(&user)?;
            info!(user_id = %user_id, "2FA enabled");
            self.audit.append(
                AuditEvent::new(AuditKind::TwoFactorEnabled, RiskLevel::Low).with_user(user_id),
            );
        } else {
            warn!(user_id = %user_id, "2FA confirm failed: invalid code");
            self.audit.append(
                AuditEvent::new(AuditKind::TwoFactorFailed, RiskLevel::Medium)
                    .with_user(user_id)
                    .with_detail(json!({"phase": "confirm"})),
            );
        }
        Ok(valid)
    }

    /// 验证 TOTP 或备份码。备份码用常量时间比较精确匹配，命中即
    /// 标记消费并落盘——同一备份码的并发提交只有一个能成功。
    #[instrument(skip(self, code, device))]
    pub async fn verify_two_factor(
        &self,
        user_id: &str,
        code: &str,
        device: &DeviceInfo,
    ) -> Result<bool> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut user = self.get_user(user_id).await?;

        let Some(enrollment) = user.totp.clone() else {
            return Ok(false);
        };
        if !enrollment.is_enabled() {
            return Ok(false);
        }

        // 1. TOTP 窗口匹配
        let secret = self.cipher.decrypt_string(&user.id, &enrollment.secret_enc)?;
        let secret_bytes = Secret::Encoded(secret)
            .to_bytes()
            .map_err(|e| AuthError::Other(format!("TOTP secret invalid: {}", e)))?;
        let totp = build_totp(secret_bytes)?;
        if totp.check_current(code).unwrap_or(false) {
            return Ok(true);
        }

        // 2. 未消费的备份码精确匹配
        let mut matched = None;
        for (idx, backup) in enrollment.backup_codes.iter().enumerate() {
            if backup.consumed_at.is_some() {
                continue;
            }
            let plain = self.cipher.decrypt_string(&user.id, &backup.code_enc)?;
            if bool::from(plain.as_bytes().ct_eq(code.as_bytes())) {
                matched = Some(idx);
                break;
            }
        }

        if let Some(idx) = matched {
            if let Some(enrollment) = user.totp.as_mut() {
                if let Some(backup) = enrollment.backup_codes.get_mut(idx) {
                    backup.consumed_at = Some(Utc::now());
                }
            }
            user.updated_at = Some(Utc::now());
            // 先落盘消费标记再放行
            self.persist_user(&user)?;
            warn!(user_id = %user_id, "backup code used for 2FA verification");
            self.audit.append(
                AuditEvent::new(AuditKind::BackupCodeUsed, RiskLevel::Medium)
                    .with_user(user_id)
                    .with_client(&device.ip, &device.user_agent),
            );
            return Ok(true);
        }

        self.audit.append(
            AuditEvent::new(AuditKind::TwoFactorFailed, RiskLevel::Medium)
                .with_user(user_id)
                .with_client(&device.ip, &device.user_agent)
                .with_detail(json!({"phase": "verify"})),
        );
        Ok(false)
    }

    /// 禁用 2FA：必须出示当前有效的 TOTP 或备份码，仅持有会话令牌
    /// 不足以移除第二因素。密文随禁用一并清除。
    #[instrument(skip(self, code, device))]
    pub async fn disable_two_factor(
        &self,
        user_id: &str,
        code: &str,
        device: &DeviceInfo,
    ) -> Result<()> {
        let verified = self.verify_two_factor(user_id, code, device).await?;
        if !verified {
            warn!(user_id = %user_id, "2FA disable failed: invalid verification");
            self.guard.record_failure(&device.ip);
            return Err(AuthError::TwoFactorInvalid);
        }

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut user = self.get_user(user_id).await?;
        if let Some(enrollment) = user.totp.as_mut() {
            enrollment.status = TotpStatus::Disabled;
            enrollment.secret_enc.clear();
            enrollment.backup_codes.clear();
        }
        user.updated_at = Some(Utc::now());
        self.persist_user(&user)?;

        info!(user_id = %user.id, "2FA disabled");
        self.audit.append(
            AuditEvent::new(AuditKind::TwoFactorDisabled, RiskLevel::Medium)
                .with_user(user_id)
                .with_client(&device.ip, &device.user_agent),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::test_support::manager;
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tempfile::TempDir;

    fn device() -> DeviceInfo {
        DeviceInfo::new("test-agent", "10.0.0.1")
    }

    fn now_ts() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn totp_for(secret_base32: &str) -> TOTP {
        let bytes = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        build_totp(bytes).unwrap()
    }

    async fn setup_enabled(manager: &UserManager) -> (User, Setup2FAResponse) {
        let user = manager
            .create_user(CreateUserRequest {
                username: "alice".into(),
                password: "S3cure-pass".into(),
                role: UserRole::User,
            })
            .await
            .unwrap();
        let setup = manager.setup_two_factor(&user.id).await.unwrap();
        let code = totp_for(&setup.secret).generate(now_ts());
        assert!(manager.confirm_two_factor(&user.id, &code).await.unwrap());
        (user, setup)
    }

    #[test]
    fn codes_are_accepted_within_one_step_and_rejected_beyond() {
        let mut secret = vec![0u8; 20];
        rand::thread_rng().fill_bytes(&mut secret);
        let totp = build_totp(secret).unwrap();

        let t = 1_700_000_000u64;
        let code = totp.generate(t);
        assert!(totp.check(&code, t));
        assert!(totp.check(&code, t + 30));
        assert!(totp.check(&code, t - 30));
        assert!(!totp.check(&code, t + 90));
    }

    #[tokio::test]
    async fn setup_stores_only_ciphertext() {
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

        let setup = manager.setup_two_factor(&user.id).await.unwrap();
        assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));
        assert_eq!(setup.backup_codes.len(), 10);

        let stored = manager.get_user(&user.id).await.unwrap();
        let enrollment = stored.totp.unwrap();
        assert_eq!(enrollment.status, TotpStatus::Pending);
        // 落盘的不是明文
        assert_ne!(enrollment.secret_enc, setup.secret);
        for (backup, plain) in enrollment.backup_codes.iter().zip(&setup.backup_codes) {
            assert_ne!(&backup.code_enc, plain);
            assert!(backup.consumed_at.is_none());
        }
    }

    #[tokio::test]
    async fn confirm_flips_pending_to_enabled() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, _) = setup_enabled(&manager).await;

        let stored = manager.get_user(&user.id).await.unwrap();
        let enrollment = stored.totp.unwrap();
        assert_eq!(enrollment.status, TotpStatus::Enabled);
        assert!(enrollment.verified_at.is_some());
    }

    #[tokio::test]
    async fn confirm_with_wrong_code_stays_pending() {
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
        manager.setup_two_factor(&user.id).await.unwrap();

        assert!(!manager.confirm_two_factor(&user.id, "000000").await.unwrap());
        let stored = manager.get_user(&user.id).await.unwrap();
        assert_eq!(stored.totp.unwrap().status, TotpStatus::Pending);
    }

    #[tokio::test]
    async fn verify_accepts_current_code_and_rejects_stale_one() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, setup) = setup_enabled(&manager).await;
        let totp = totp_for(&setup.secret);

        let current = totp.generate(now_ts());
        assert!(manager
            .verify_two_factor(&user.id, &current, &device())
            .await
            .unwrap());

        // 超出 ±1 步容差的过期验证码
        let stale = totp.generate(now_ts() - 120);
        assert!(!manager
            .verify_two_factor(&user.id, &stale, &device())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pending_enrollment_does_not_verify() {
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
        let setup = manager.setup_two_factor(&user.id).await.unwrap();

        let code = totp_for(&setup.secret).generate(now_ts());
        assert!(!manager
            .verify_two_factor(&user.id, &code, &device())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn backup_codes_are_single_use() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, setup) = setup_enabled(&manager).await;

        let backup = setup.backup_codes[0].clone();
        assert!(manager
            .verify_two_factor(&user.id, &backup, &device())
            .await
            .unwrap());
        // 二次使用被拒绝
        assert!(!manager
            .verify_two_factor(&user.id, &backup, &device())
            .await
            .unwrap());
        // 其它备份码不受影响
        assert!(manager
            .verify_two_factor(&user.id, &setup.backup_codes[1], &device())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_submissions_of_one_backup_code_yield_one_success() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, setup) = setup_enabled(&manager).await;

        let backup = setup.backup_codes[0].clone();
        let (m1, m2) = (manager.clone(), manager.clone());
        let (u1, u2) = (user.id.clone(), user.id.clone());
        let (b1, b2) = (backup.clone(), backup);
        let (r1, r2) = tokio::join!(
            async move { m1.verify_two_factor(&u1, &b1, &device()).await },
            async move { m2.verify_two_factor(&u2, &b2, &device()).await },
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        assert!(r1 != r2, "exactly one submission may succeed");
    }

    #[tokio::test]
    async fn disable_requires_a_valid_code_and_clears_secrets() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, setup) = setup_enabled(&manager).await;

        let err = manager
            .disable_two_factor(&user.id, "000000", &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TwoFactorInvalid));

        let code = totp_for(&setup.secret).generate(now_ts());
        manager
            .disable_two_factor(&user.id, &code, &device())
            .await
            .unwrap();

        let stored = manager.get_user(&user.id).await.unwrap();
        let enrollment = stored.totp.unwrap();
        assert_eq!(enrollment.status, TotpStatus::Disabled);
        assert!(enrollment.secret_enc.is_empty());
        assert!(enrollment.backup_codes.is_empty());

        // 禁用后不再接受验证码
        let code = totp_for(&setup.secret).generate(now_ts());
        assert!(!manager
            .verify_two_factor(&user.id, &code, &device())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fresh_setup_replaces_a_disabled_enrollment() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let (user, setup) = setup_enabled(&manager).await;

        let code = totp_for(&setup.secret).generate(now_ts());
        manager
            .disable_two_factor(&user.id, &code, &device())
            .await
            .unwrap();

        // 重新 setup 产生全新的 PENDING 注册
        let second = manager.setup_two_factor(&user.id).await.unwrap();
        assert_ne!(second.secret, setup.secret);
        let stored = manager.get_user(&user.id).await.unwrap();
        assert_eq!(stored.totp.unwrap().status, TotpStatus::Pending);

        let code = totp_for(&second.secret).generate(now_ts());
        assert!(manager.confirm_two_factor(&user.id, &code).await.unwrap());
    }
}
