//! 会话数据模型

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};

/// 登录来源的设备信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub ip: String,
    /// sha256(user_agent|ip)，用于在会话列表里识别同一设备
    pub fingerprint: String,
}

impl DeviceInfo {
    pub fn new(user_agent: impl Into<String>, ip: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        let ip = ip.into();
        let digest = Sha256::digest(format!("{}|{}", user_agent, ip).as_bytes());
        let fingerprint = general_purpose::URL_SAFE_NO_PAD.encode(digest);
        Self {
            user_agent,
            ip,
            fingerprint,
        }
    }
}

/// 会话记录。创建后除撤销字段外不可变；撤销是终态。
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// access token 的 jti，同时作为会话 ID
    pub jti: String,
    /// 配对 refresh token 的 jti（轮换时整个会话被撤销重建）
    pub refresh_jti: String,
    pub user_id: String,
    pub device: DeviceInfo,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
    pub revoked_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_active(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

/// 会话摘要（自助查看用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub device: DeviceInfo,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.jti.clone(),
            device: session.device.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_per_device() {
        let a = DeviceInfo::new("Mozilla/5.0", "10.0.0.1");
        let b = DeviceInfo::new("Mozilla/5.0", "10.0.0.1");
        let c = DeviceInfo::new("Mozilla/5.0", "10.0.0.2");
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}
