//! 密码哈希工具函数

use crate::error::{AuthError, Result};
use bcrypt::{hash, verify};

pub use bcrypt::DEFAULT_COST;

/// 异步哈希密码（在阻塞线程中执行 bcrypt，cost 内嵌于摘要）
pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash(&password, cost))
        .await
        .map_err(|e| AuthError::Other(format!("spawn_blocking failed: {}", e)))?
        .map_err(|e| AuthError::Other(format!("bcrypt hash failed: {}", e)))
}

/// 异步验证密码（在阻塞线程中执行 bcrypt）；摘要不匹配返回 false，不报错
pub async fn verify_password(password: &str, digest: &str) -> Result<bool> {
    let password = password.to_string();
    let digest = digest.to_string();
    tokio::task::spawn_blocking(move || verify(&password, &digest))
        .await
        .map_err(|e| AuthError::Other(format!("spawn_blocking failed: {}", e)))?
        .map_err(|e| AuthError::Other(format!("bcrypt verify failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 测试用最低 cost，避免每条用例都付完整的哈希成本
    const TEST_COST: u32 = 4;

    #[tokio::test]
    async fn verify_accepts_the_original_password() {
        let digest = hash_password("S3cure-pass", TEST_COST).await.unwrap();
        assert!(verify_password("S3cure-pass", &digest).await.unwrap());
    }

    #[tokio::test]
    async fn verify_rejects_single_character_mutations() {
        let digest = hash_password("S3cure-pass", TEST_COST).await.unwrap();
        assert!(!verify_password("S3cure-past", &digest).await.unwrap());
        assert!(!verify_password("s3cure-pass", &digest).await.unwrap());
        assert!(!verify_password("S3cure-pas", &digest).await.unwrap());
    }

    #[tokio::test]
    async fn cost_change_keeps_old_digests_valid() {
        let old = hash_password("S3cure-pass", TEST_COST).await.unwrap();
        // cost 调高后旧摘要仍按自身内嵌的 cost 验证
        let new = hash_password("S3cure-pass", TEST_COST + 1).await.unwrap();
        assert!(verify_password("S3cure-pass", &old).await.unwrap());
        assert!(verify_password("S3cure-pass", &new).await.unwrap());
        assert_ne!(old, new);
    }
}
