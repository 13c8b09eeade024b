//! 登录失败跟踪与来源 IP 锁定

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::warn;

use crate::audit::{AuditEvent, AuditKind, AuditLog, RiskLevel};

const DEFAULT_MAX_FAILURES: usize = 5;
const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);
const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// 暴力破解防护：滑动窗口内统计认证失败，达到阈值后锁定来源 IP。
///
/// 锁定检查必须发生在密码比较之前，被锁定的来源不进入哈希验证。
/// 与通用限流相反，存储不可用（锁中毒）时判定为已锁定（fail-closed）：
/// 认证防护的语义在降级时必须保持。锁定记录到期自清理，不提供手动解锁。
pub struct BruteForceGuard {
    max_failures: usize,
    failure_window: Duration,
    block_duration: Duration,
    failures: Mutex<HashMap<String, Vec<Instant>>>,
    /// key -> 解锁时刻
    blocks: Mutex<HashMap<String, Instant>>,
    audit: AuditLog,
}

impl BruteForceGuard {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            failure_window: DEFAULT_FAILURE_WINDOW,
            block_duration: DEFAULT_BLOCK_DURATION,
            failures: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// 配置失败阈值、统计窗口与锁定时长
    pub fn with_policy(
        mut self,
        max_failures: usize,
        failure_window: Duration,
        block_duration: Duration,
    ) -> Self {
        self.max_failures = max_failures;
        self.failure_window = failure_window;
        self.block_duration = block_duration;
        self
    }

    /// 是否处于锁定状态；存储不可用时视为锁定
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut blocks = match self.blocks.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(key = %key, "lockout store unavailable, failing closed");
                return true;
            }
        };
        match blocks.get(key) {
            Some(until) if *until > now => true,
            Some(_) => {
                // 到期自清理
                blocks.remove(key);
                false
            }
            None => false,
        }
    }

    /// 锁定剩余秒数；未锁定返回 0
    pub fn retry_after(&self, key: &str) -> u64 {
        let now = Instant::now();
        let blocks = match self.blocks.lock() {
            Ok(guard) => guard,
            Err(_) => return self.block_duration.as_secs(),
        };
        blocks
            .get(key)
            .map(|until| until.saturating_duration_since(now).as_secs().max(1))
            .unwrap_or(0)
    }

    /// 记录一次认证失败；窗口内达到阈值时触发锁定
    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let count = {
            let mut failures = match self.failures.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(key = %key, "failure counter unavailable, skipping record");
                    return;
                }
            };
            let entry = failures.entry(key.to_string()).or_default();
            entry.retain(|t| now.duration_since(*t) < self.failure_window);
            entry.push(now);
            entry.len()
        };
        if count >= self.max_failures {
            self.block(key, count);
        }
    }

    /// 设置锁定记录并写入高风险审计事件
    fn block(&self, key: &str, failures: usize) {
        let now = Instant::now();
        let newly_blocked = match self.blocks.lock() {
            Ok(mut blocks) => {
                let was_blocked = blocks.get(key).map(|until| *until > now).unwrap_or(false);
                blocks.insert(key.to_string(), now + self.block_duration);
                !was_blocked
            }
            Err(_) => {
                warn!(key = %key, "lockout store unavailable while blocking");
                false
            }
        };
        if newly_blocked {
            warn!(key = %key, failures, "source locked out after repeated auth failures");
            self.audit.append(
                AuditEvent::new(AuditKind::LockoutTriggered, RiskLevel::High)
                    .with_client(key, "")
                    .with_detail(json!({
                        "failures": failures,
                        "block_seconds": self.block_duration.as_secs(),
                    })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn guard(dir: &TempDir) -> (BruteForceGuard, AuditLog) {
        let audit = AuditLog::spawn(dir.path());
        (BruteForceGuard::new(audit.clone()), audit)
    }

    #[tokio::test]
    async fn blocks_after_threshold_failures() {
        let dir = TempDir::new().unwrap();
        let (guard, audit) = guard(&dir);

        for _ in 0..4 {
            guard.record_failure("10.0.0.1");
        }
        assert!(!guard.is_blocked("10.0.0.1"));

        guard.record_failure("10.0.0.1");
        assert!(guard.is_blocked("10.0.0.1"));
        assert!(guard.retry_after("10.0.0.1") > 0);
        // 其它来源不受影响
        assert!(!guard.is_blocked("10.0.0.2"));

        audit.flush().await;
        let events = audit
            .query(&AuditQuery {
                kind: Some(AuditKind::LockoutTriggered),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].risk, RiskLevel::High);
    }

    #[tokio::test]
    async fn block_expires_on_its_own() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::spawn(dir.path());
        let guard = BruteForceGuard::new(audit).with_policy(
            2,
            Duration::from_secs(60),
            Duration::from_millis(80),
        );

        guard.record_failure("ip");
        guard.record_failure("ip");
        assert!(guard.is_blocked("ip"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!guard.is_blocked("ip"));
        assert_eq!(guard.retry_after("ip"), 0);
    }

    #[tokio::test]
    async fn fails_closed_when_store_poisoned() {
        let dir = TempDir::new().unwrap();
        let (guard, _audit) = guard(&dir);
        let guard = Arc::new(guard);
        assert!(!guard.is_blocked("ip"));

        let poisoner = guard.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.blocks.lock().unwrap();
            panic!("poison the lockout store");
        })
        .join();

        // 存储不可用：判定为锁定
        assert!(guard.is_blocked("ip"));
        assert!(guard.retry_after("ip") > 0);
    }
}
