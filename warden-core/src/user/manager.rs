//! 用户管理器：核心结构和用户 CRUD 操作

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::crypto::{hash_password, DEFAULT_COST};
use super::encryption::SecretCipher;
use super::models::*;
use crate::audit::AuditLog;
use crate::error::{AuthError, Result};
use crate::lockout::BruteForceGuard;
use crate::session::{SessionRegistry, REASON_PASSWORD_CHANGED};

const DEFAULT_JWT_ISSUER: &str = "warden-api";
const DEFAULT_JWT_AUDIENCE: &str = "warden-clients";
const DEFAULT_TOTP_ISSUER: &str = "Warden";

/// 用户管理器：认证核心的对外门面。
///
/// 会话注册表、锁定防护、审计日志与加密器都在启动时构造一次注入，
/// 不存在进程级单例。
#[derive(Clone)]
pub struct UserManager {
    /// 用户数据存储目录
    pub(super) data_dir: PathBuf,
    /// JWT 签名密钥
    pub(super) jwt_secret: String,
    /// JWT issuer
    pub(super) jwt_issuer: String,
    /// JWT audience
    pub(super) jwt_audience: String,
    /// Access token 有效期（秒）
    pub(super) access_token_ttl: i64,
    /// Refresh token 有效期（秒）；会话有效期与其对齐
    pub(super) refresh_token_ttl: i64,
    /// 2FA 挑战 token 有效期（秒）
    pub(super) challenge_token_ttl: i64,
    /// bcrypt cost（只影响新摘要）
    pub(super) bcrypt_cost: u32,
    /// otpauth URI 里展示的发行方
    pub(super) totp_issuer: String,
    pub(super) cipher: SecretCipher,
    pub(super) sessions: Arc<SessionRegistry>,
    pub(super) guard: Arc<BruteForceGuard>,
    pub(super) audit: AuditLog,
    /// 未知用户统一耗时用的占位摘要（按需生成一次）
    timing_pad: Arc<OnceLock<String>>,
    /// 按用户串行化注册信息变更（备份码一次性消费等）
    user_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

// ============================================================================
// 构造器和配置
// ============================================================================

impl UserManager {
    /// 创建新的用户管理器
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        jwt_secret: String,
        master_key: [u8; 32],
        sessions: Arc<SessionRegistry>,
        guard: Arc<BruteForceGuard>,
        audit: AuditLog,
    ) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            jwt_secret,
            jwt_issuer: DEFAULT_JWT_ISSUER.to_string(),
            jwt_audience: DEFAULT_JWT_AUDIENCE.to_string(),
            access_token_ttl: 15 * 60,        // 15 分钟
            refresh_token_ttl: 7 * 24 * 3600, // 7 天
            challenge_token_ttl: 5 * 60,      // 5 分钟
            bcrypt_cost: DEFAULT_COST,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            cipher: SecretCipher::new(master_key),
            sessions,
            guard,
            audit,
            timing_pad: Arc::new(OnceLock::new()),
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 配置 JWT iss/aud
    pub fn with_claims_context(
        mut self,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        self.jwt_issuer = issuer.into();
        self.jwt_audience = audience.into();
        self
    }

    /// 配置 token 有效期
    pub fn with_token_ttl(mut self, access_ttl: i64, refresh_ttl: i64) -> Self {
        self.access_token_ttl = access_ttl;
        self.refresh_token_ttl = refresh_ttl;
        self
    }

    /// 配置 bcrypt cost；旧摘要不受影响（cost 内嵌于摘要）
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// 配置 otpauth URI 的发行方名称
    pub fn with_totp_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.totp_issuer = issuer.into();
        self
    }

    /// 会话注册表句柄（协作方自助会话管理用）
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

// ============================================================================
// 内部辅助方法
// ============================================================================

impl UserManager {
    /// 确保用户目录存在
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.users_dir())?;
        Ok(())
    }

    fn users_dir(&self) -> PathBuf {
        self.data_dir.join("users")
    }

    fn user_path(&self, id: &str) -> PathBuf {
        self.users_dir().join(format!("{}.json", id))
    }

    /// 用户名索引文件路径
    fn index_path(&self) -> PathBuf {
        self.users_dir().join("index.json")
    }

    /// 加载用户名 -> ID 索引
    fn load_username_index(&self) -> HashMap<String, String> {
        let path = self.index_path();
        if let Ok(data) = fs::read(&path) {
            if let Ok(map) = serde_json::from_slice::<HashMap<String, String>>(&data) {
                return map;
            }
        }
        HashMap::new()
    }

    /// 保存用户名索引
    fn save_username_index(&self, index: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        fs::write(self.index_path(), data)?;
        Ok(())
    }

    /// 持久化用户数据
    pub(super) fn persist_user(&self, user: &User) -> Result<()> {
        let data = serde_json::to_vec_pretty(user)?;
        std::fs::write(self.user_path(&user.id), data)?;
        Ok(())
    }

    /// 按用户取互斥锁，串行化该用户的注册信息变更
    pub(super) async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 未知用户也要走一次完整的哈希比较，保持成功/失败路径耗时一致。
    /// 占位摘要用当前 cost 生成一次后复用。
    pub(super) async fn timing_pad_digest(&self) -> String {
        if let Some(digest) = self.timing_pad.get() {
            return digest.clone();
        }
        let digest = hash_password("warden.timing.pad", self.bcrypt_cost)
            .await
            .unwrap_or_default();
        self.timing_pad.get_or_init(|| digest).clone()
    }
}

// ============================================================================
// 用户 CRUD 操作
// ============================================================================

impl UserManager {
    /// 创建用户
    #[instrument(skip(self, req))]
    pub async fn create_user(&self, req: CreateUserRequest) -> Result<User> {
        self.ensure_dirs()?;

        // 检查用户名是否已存在
        if self.find_by_username(&req.username).await?.is_some() {
            return Err(AuthError::AlreadyExists(format!(
                "username: {}",
                req.username
            )));
        }

        Self::validate_password_strength(&req.password)?;
        let password_hash = hash_password(&req.password, self.bcrypt_cost).await?;

        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: req.username,
            password_hash,
            role: req.role,
            totp: None,
            created_at: Some(now),
            updated_at: Some(now),
        };

        self.persist_user(&user)?;
        let mut index = self.load_username_index();
        index.insert(user.username.clone(), user.id.clone());
        self.save_username_index(&index)?;

        info!(user_id = %user.id, username = %user.username, "created user");
        Ok(user)
    }

    /// 首次启动时创建管理员账号；用户名已存在则不做任何事
    #[instrument(skip(self, password))]
    pub async fn bootstrap_admin(&self, username: &str, password: &str) -> Result<Option<User>> {
        if self.find_by_username(username).await?.is_some() {
            return Ok(None);
        }
        let user = self
            .create_user(CreateUserRequest {
                username: username.to_string(),
                password: password.to_string(),
                role: UserRole::Admin,
            })
            .await?;
        info!(username = %username, "bootstrapped admin user");
        Ok(Some(user))
    }

    /// 获取用户
    #[instrument(skip(self))]
    pub async fn get_user(&self, id: &str) -> Result<User> {
        let path = self.user_path(id);
        if !path.exists() {
            return Err(AuthError::NotFound(format!("user: {}", id)));
        }
        let data = std::fs::read(&path)?;
        let user: User = serde_json::from_slice(&data)?;
        Ok(user)
    }

    /// 通过用户名查找（优先使用索引，索引缺失时退回目录扫描）
    #[instrument(skip(self))]
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        self.ensure_dirs()?;
        let index = self.load_username_index();

        if let Some(id) = index.get(username) {
            match self.get_user(id).await {
                Ok(user) => return Ok(Some(user)),
                Err(AuthError::NotFound(_)) => {
                    // 索引指向的用户不存在，清理索引
                    let mut index = index;
                    index.remove(username);
                    let _ = self.save_username_index(&index);
                }
                Err(e) => return Err(e),
            }
        }

        // 逐个读取用户文件，找到匹配的用户名即停止
        let dir = self.users_dir();
        if !dir.exists() {
            return Ok(None);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false)
                && path.file_stem().map(|s| s != "index").unwrap_or(true)
            {
                if let Ok(data) = std::fs::read(&path) {
                    if let Ok(user) = serde_json::from_slice::<User>(&data) {
                        if user.username == username {
                            let mut index = self.load_username_index();
                            index.insert(username.to_string(), user.id.clone());
                            let _ = self.save_username_index(&index);
                            return Ok(Some(user));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    /// 列出所有用户
    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.ensure_dirs()?;
        let mut users = Vec::new();

        let dir = self.users_dir();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.file_stem().map(|s| s == "index").unwrap_or(false) {
                    continue;
                }
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Ok(data) = std::fs::read(&path) {
                        if let Ok(user) = serde_json::from_slice::<User>(&data) {
                            users.push(user);
                        }
                    }
                }
            }
        }

        Ok(users)
    }

    /// 更新用户。改密或改角色都会撤销该用户全部会话，
    /// 旧 token 里过期的角色声明随之失效。
    #[instrument(skip(self, req))]
    pub async fn update_user(&self, id: &str, req: UpdateUserRequest) -> Result<User> {
        let mut user = self.get_user(id).await?;

        let mut revoke = false;
        if let Some(password) = req.password {
            Self::validate_password_strength(&password)?;
            user.password_hash = hash_password(&password, self.bcrypt_cost).await?;
            revoke = true;
        }
        if let Some(role) = req.role {
            if user.role != role {
                user.role = role;
                revoke = true;
            }
        }

        user.updated_at = Some(Utc::now());
        self.persist_user(&user)?;

        if revoke {
            self.sessions
                .revoke_all(&user.id, REASON_PASSWORD_CHANGED)
                .await?;
        }

        info!(user_id = %id, "updated user");
        Ok(user)
    }

    /// 删除用户并撤销其全部会话
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: &str) -> Result<()> {
        let path = self.user_path(id);
        if !path.exists() {
            return Err(AuthError::NotFound(format!("user: {}", id)));
        }

        self.sessions.revoke_all(id, "user_deleted").await?;

        std::fs::remove_file(&path)?;
        let mut index = self.load_username_index();
        index.retain(|_, uid| uid != id);
        self.save_username_index(&index)?;
        info!(user_id = %id, "deleted user");
        Ok(())
    }
}

#[cfg(test)]
pub(super) mod test_support {
    use super::*;
    use crate::audit::AuditLog;
    use tempfile::TempDir;

    /// 测试用低成本管理器；cost 取 bcrypt 合法下限避免拖慢用例
    pub fn manager(dir: &TempDir) -> UserManager {
        let audit = AuditLog::spawn(dir.path());
        let sessions = Arc::new(SessionRegistry::new(dir.path(), audit.clone()));
        let guard = Arc::new(BruteForceGuard::new(audit.clone()));
        UserManager::new(
            dir.path(),
            "test-secret".to_string(),
            [7u8; 32],
            sessions,
            guard,
            audit,
        )
        .with_bcrypt_cost(4)
    }
}
