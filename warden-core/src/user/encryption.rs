//! 静态敏感数据加密
//!
//! AES-256-GCM 认证加密；工作密钥由进程级主密钥 + 实体 ID 经
//! HKDF-SHA256 派生，同一主密钥下不同实体的密文互相隔离。
//! 主密钥在启动时载入一次，丢失即意味着所有密文不可恢复。

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{AuthError, Result};

const KEY_CONTEXT: &[u8] = b"warden.secret.v1";

/// 进程级对称加密器
#[derive(Clone)]
pub struct SecretCipher {
    master_key: [u8; 32],
}

impl SecretCipher {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// 从 base64 编码载入 32 字节主密钥
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AuthError::EncryptionFailure(format!("invalid master key: {}", e)))?;
        let master_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::EncryptionFailure("master key must be 32 bytes".into()))?;
        Ok(Self::new(master_key))
    }

    /// 为实体派生独立的工作密钥（HKDF-SHA256）
    fn derive_key(&self, entity_id: &str) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.master_key);
        let mut info = KEY_CONTEXT.to_vec();
        info.push(b'|');
        info.extend_from_slice(entity_id.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm).expect("HKDF expand failed");
        okm
    }

    /// 加密；返回 base64(nonce || ciphertext)
    pub fn encrypt(&self, entity_id: &str, plaintext: &[u8]) -> Result<String> {
        let key = self.derive_key(entity_id);
        let cipher = Aes256Gcm::new(&key.into());

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AuthError::EncryptionFailure(format!("encryption failed: {}", e)))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(out))
    }

    /// 解密。密文被篡改或实体不匹配时完整性校验整体拒绝，
    /// 不会返回部分解密的内容。
    pub fn decrypt(&self, entity_id: &str, encoded: &str) -> Result<Vec<u8>> {
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::EncryptionFailure("invalid ciphertext encoding".into()))?;
        if data.len() < 12 {
            return Err(AuthError::EncryptionFailure("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = data.split_at(12);
        let key = self.derive_key(entity_id);
        let cipher = Aes256Gcm::new(&key.into());

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::EncryptionFailure("decryption failed".into()))
    }

    /// 解密为 UTF-8 字符串
    pub fn decrypt_string(&self, entity_id: &str, encoded: &str) -> Result<String> {
        let plaintext = self.decrypt(entity_id, encoded)?;
        String::from_utf8(plaintext)
            .map_err(|_| AuthError::EncryptionFailure("plaintext is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::new([42u8; 32])
    }

    #[test]
    fn roundtrip() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("user-1", b"my-totp-seed").unwrap();
        assert_ne!(encrypted.as_bytes(), b"my-totp-seed");
        let decrypted = cipher.decrypt("user-1", &encrypted).unwrap();
        assert_eq!(decrypted, b"my-totp-seed");
    }

    #[test]
    fn tampered_ciphertext_is_rejected_outright() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("user-1", b"secret").unwrap();
        let mut raw = general_purpose::STANDARD.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = general_purpose::STANDARD.encode(raw);

        let result = cipher.decrypt("user-1", &tampered);
        assert!(matches!(result, Err(AuthError::EncryptionFailure(_))));
    }

    #[test]
    fn entities_are_cryptographically_isolated() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("user-1", b"secret").unwrap();
        let result = cipher.decrypt("user-2", &encrypted);
        assert!(matches!(result, Err(AuthError::EncryptionFailure(_))));
    }

    #[test]
    fn wrong_master_key_is_rejected() {
        let encrypted = cipher().encrypt("user-1", b"secret").unwrap();
        let other = SecretCipher::new([7u8; 32]);
        assert!(other.decrypt("user-1", &encrypted).is_err());
    }

    #[test]
    fn master_key_must_be_32_bytes() {
        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(SecretCipher::from_base64(&short).is_err());
        let ok = general_purpose::STANDARD.encode([1u8; 32]);
        assert!(SecretCipher::from_base64(&ok).is_ok());
    }
}
