//! 会话注册表
//!
//! 会话以 JSON 文件落盘（每会话一个文件），启动时载入内存索引；
//! 文件是持久层的事实来源，内存索引只是加速。创建-驱逐序列按用户
//! 加锁线性化，互不相关的用户并行执行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use super::models::{DeviceInfo, Session};
use crate::audit::{AuditEvent, AuditKind, AuditLog, RiskLevel};
use crate::error::{AuthError, Result};

/// 每用户默认并发会话上限
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 3;

pub const REASON_MAX_SESSIONS: &str = "max_sessions_exceeded";
pub const REASON_LOGOUT: &str = "logout";
pub const REASON_ROTATED: &str = "refresh_rotated";
pub const REASON_PASSWORD_CHANGED: &str = "password_changed";

#[derive(Default)]
struct SessionIndex {
    by_jti: HashMap<String, Session>,
    /// refresh jti -> access jti
    by_refresh: HashMap<String, String>,
}

/// 会话注册表
pub struct SessionRegistry {
    data_dir: PathBuf,
    max_per_user: usize,
    index: RwLock<SessionIndex>,
    /// 按用户串行化创建-驱逐序列
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    audit: AuditLog,
}

impl SessionRegistry {
    pub fn new<P: AsRef<Path>>(data_dir: P, audit: AuditLog) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            max_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            index: RwLock::new(SessionIndex::default()),
            user_locks: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// 配置每用户并发会话上限
    pub fn with_max_sessions(mut self, max_per_user: usize) -> Self {
        self.max_per_user = max_per_user.max(1);
        self
    }

    /// 确保会话目录存在
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }

    fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    fn session_path(&self, jti: &str) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", jti))
    }

    /// 从磁盘载入全部会话，返回载入数量（损坏的文件跳过）
    pub async fn load(&self) -> Result<usize> {
        self.ensure_dirs()?;
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(self.sessions_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(path);
            }
        }

        let reads = join_all(paths.iter().map(tokio::fs::read)).await;
        let mut index = self.index.write().await;
        let mut loaded = 0;
        for (path, data) in paths.iter().zip(reads) {
            let Ok(data) = data else {
                warn!(path = %path.display(), "failed to read session file, skipping");
                continue;
            };
            match serde_json::from_slice::<Session>(&data) {
                Ok(session) => {
                    index
                        .by_refresh
                        .insert(session.refresh_jti.clone(), session.jti.clone());
                    index.by_jti.insert(session.jti.clone(), session);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt session file, skipping");
                }
            }
        }
        Ok(loaded)
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(self.session_path(&session.jti), data).await?;
        Ok(())
    }

    /// 创建会话。同一用户的计数-驱逐-写入整体串行：两个并发登录
    /// 不会都认为自己在上限之内。达到上限时按创建时间从最旧开始驱逐。
    #[instrument(skip(self, device))]
    pub async fn create(
        &self,
        user_id: &str,
        jti: &str,
        refresh_jti: &str,
        device: DeviceInfo,
        ttl: Duration,
    ) -> Result<Session> {
        self.ensure_dirs()?;
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        {
            let index = self.index.read().await;
            if index.by_jti.contains_key(jti) {
                return Err(AuthError::AlreadyExists(format!("session jti: {}", jti)));
            }
        }

        // 活跃会话按创建时间排序，驱逐最旧的直到让出一个位置
        let mut active = self.list_active(user_id).await;
        active.sort_by_key(|s| s.created_at);
        let evict = (active.len() + 1).saturating_sub(self.max_per_user);
        for victim in active.iter().take(evict) {
            self.revoke(&victim.jti, REASON_MAX_SESSIONS).await?;
        }

        let now = Utc::now();
        let session = Session {
            jti: jti.to_string(),
            refresh_jti: refresh_jti.to_string(),
            user_id: user_id.to_string(),
            device,
            created_at: now,
            expires_at: now + ttl,
            revoked: false,
            revoked_reason: None,
            revoked_at: None,
        };
        self.persist(&session).await?;

        let mut index = self.index.write().await;
        index
            .by_refresh
            .insert(session.refresh_jti.clone(), session.jti.clone());
        index.by_jti.insert(session.jti.clone(), session.clone());

        info!(user_id = %user_id, jti = %jti, evicted = evict, "session created");
        Ok(session)
    }

    /// 校验会话是否活跃。过期视为不存在（惰性过期，物理清理交给 sweep）。
    pub async fn validate(&self, jti: &str) -> Option<Session> {
        let index = self.index.read().await;
        index.by_jti.get(jti).filter(|s| s.is_active()).cloned()
    }

    /// 原样取回会话（包含已撤销/已过期的）
    pub async fn get(&self, jti: &str) -> Option<Session> {
        let index = self.index.read().await;
        index.by_jti.get(jti).cloned()
    }

    /// 按 refresh jti 取回会话（令牌轮换用）
    pub async fn get_by_refresh(&self, refresh_jti: &str) -> Option<Session> {
        let index = self.index.read().await;
        let jti = index.by_refresh.get(refresh_jti)?;
        index.by_jti.get(jti).cloned()
    }

    /// 撤销会话。撤销是终态：已撤销的会话保持第一次的原因不变。
    #[instrument(skip(self))]
    pub async fn revoke(&self, jti: &str, reason: &str) -> Result<Session> {
        let updated = {
            let mut index = self.index.write().await;
            let session = index
                .by_jti
                .get_mut(jti)
                .ok_or_else(|| AuthError::NotFound(format!("session: {}", jti)))?;
            // 条件更新：只有未撤销的会话才翻转状态
            if session.revoked {
                return Ok(session.clone());
            }
            session.revoked = true;
            session.revoked_reason = Some(reason.to_string());
            session.revoked_at = Some(Utc::now());
            session.clone()
        };
        self.persist(&updated).await?;

        info!(jti = %jti, reason = %reason, "session revoked");
        self.audit.append(
            AuditEvent::new(AuditKind::SessionRevoked, RiskLevel::Low)
                .with_user(&updated.user_id)
                .with_detail(json!({"jti": jti, "reason": reason})),
        );
        Ok(updated)
    }

    /// 撤销某用户的全部活跃会话，返回撤销数量
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, user_id: &str, reason: &str) -> Result<usize> {
        let targets: Vec<String> = {
            let index = self.index.read().await;
            index
                .by_jti
                .values()
                .filter(|s| s.user_id == user_id && !s.revoked)
                .map(|s| s.jti.clone())
                .collect()
        };
        for jti in &targets {
            self.revoke(jti, reason).await?;
        }
        Ok(targets.len())
    }

    /// 某用户的活跃会话（按创建时间升序）
    pub async fn list_active(&self, user_id: &str) -> Vec<Session> {
        let index = self.index.read().await;
        let mut sessions: Vec<Session> = index
            .by_jti
            .values()
            .filter(|s| s.user_id == user_id && s.is_active())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// 某用户的活跃会话数
    pub async fn active_count(&self, user_id: &str) -> usize {
        self.list_active(user_id).await.len()
    }

    /// 物理清理已过期的会话文件与索引项，返回清理数量
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired: Vec<Session> = {
            let index = self.index.read().await;
            index
                .by_jti
                .values()
                .filter(|s| s.is_expired())
                .cloned()
                .collect()
        };
        if expired.is_empty() {
            return Ok(0);
        }

        let mut index = self.index.write().await;
        for session in &expired {
            index.by_jti.remove(&session.jti);
            index.by_refresh.remove(&session.refresh_jti);
            let path = self.session_path(&session.jti);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(jti = %session.jti, error = %e, "failed to remove expired session file");
                }
            }
        }
        info!(count = expired.len(), "expired sessions swept");
        Ok(expired.len())
    }
}
