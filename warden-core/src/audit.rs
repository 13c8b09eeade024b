//! 安全审计日志：追加写入与查询聚合
//!
//! 追加走 mpsc 通道交给后台任务落盘（JSONL 一行一事件），对调用方永不阻塞；
//! 通道满或写盘失败时降级为本地 tracing 日志，绝不反过来中断触发它的安全操作。
//! 查询/聚合只读文件，与写入路径完全分离。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

/// 事件风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    LoginSuccess,
    LoginFailed,
    LockoutTriggered,
    TokenRefreshed,
    SessionRevoked,
    PasswordChanged,
    TwoFactorSetup,
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorFailed,
    BackupCodeUsed,
}

/// 审计事件（追加后不可变）
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub user_id: Option<String>,
    pub kind: AuditKind,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub risk: RiskLevel,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, risk: RiskLevel) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            kind,
            detail: serde_json::Value::Null,
            ip: None,
            user_agent: None,
            risk,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// 查询过滤条件；None 表示不限制
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub kind: Option<AuditKind>,
    pub risk: Option<RiskLevel>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user_id) = &self.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(risk) = self.risk {
            if event.risk != risk {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// 滚动窗口内的聚合计数
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total: u64,
    pub by_kind: HashMap<AuditKind, u64>,
    pub by_risk: HashMap<RiskLevel, u64>,
}

enum WriterMsg {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
}

/// 审计日志句柄（可克隆；`append` 对调用方永不失败）
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<WriterMsg>,
    log_path: PathBuf,
}

impl AuditLog {
    /// 启动后台写入任务并返回句柄
    pub fn spawn<P: AsRef<Path>>(data_dir: P) -> Self {
        let log_path = data_dir.as_ref().join("audit.log");
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(rx, log_path.clone()));
        Self { tx, log_path }
    }

    /// 追加事件；存储不可用时降级为本地日志，不向调用方返回错误
    pub fn append(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(WriterMsg::Event(Box::new(event))) {
            let msg = match e {
                mpsc::error::TrySendError::Full(msg) => msg,
                mpsc::error::TrySendError::Closed(msg) => msg,
            };
            if let WriterMsg::Event(event) = msg {
                warn!(
                    kind = ?event.kind,
                    user_id = ?event.user_id,
                    risk = ?event.risk,
                    "audit channel unavailable, event degraded to local log"
                );
            }
        }
    }

    /// 等待已入队事件全部落盘（测试与停机用）
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// 按条件查询事件
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let data = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in data.lines() {
            // 跳过损坏的行，不让单条坏记录毁掉整个查询
            let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                continue;
            };
            if filter.matches(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// 滚动窗口内按类型/风险聚合计数
    pub async fn summary(&self, window: Duration) -> Result<AuditSummary> {
        let filter = AuditQuery {
            since: Some(Utc::now() - window),
            ..AuditQuery::default()
        };
        let events = self.query(&filter).await?;

        let mut by_kind: HashMap<AuditKind, u64> = HashMap::new();
        let mut by_risk: HashMap<RiskLevel, u64> = HashMap::new();
        for event in &events {
            *by_kind.entry(event.kind).or_default() += 1;
            *by_risk.entry(event.risk).or_default() += 1;
        }

        Ok(AuditSummary {
            total: events.len() as u64,
            by_kind,
            by_risk,
        })
    }
}

async fn writer_loop(mut rx: mpsc::Receiver<WriterMsg>, path: PathBuf) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Event(event) => {
                if let Err(e) = append_line(&path, &event).await {
                    error!(
                        error = %e,
                        kind = ?event.kind,
                        user_id = ?event.user_id,
                        "audit write failed, event degraded to local log"
                    );
                }
            }
            WriterMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn append_line(path: &Path, event: &AuditEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_query() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::spawn(dir.path());

        audit.append(
            AuditEvent::new(AuditKind::LoginFailed, RiskLevel::Medium)
                .with_user("u1")
                .with_client("10.0.0.1", "test-agent"),
        );
        audit.append(AuditEvent::new(AuditKind::LockoutTriggered, RiskLevel::High).with_user("u1"));
        audit.append(AuditEvent::new(AuditKind::LoginSuccess, RiskLevel::Low).with_user("u2"));
        audit.flush().await;

        let all = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let failed = audit
            .query(&AuditQuery {
                kind: Some(AuditKind::LoginFailed),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].ip.as_deref(), Some("10.0.0.1"));

        let u1 = audit
            .query(&AuditQuery {
                user_id: Some("u1".into()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(u1.len(), 2);
    }

    #[tokio::test]
    async fn summary_counts_by_kind_and_risk() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::spawn(dir.path());

        for _ in 0..3 {
            audit.append(AuditEvent::new(AuditKind::LoginFailed, RiskLevel::Medium));
        }
        audit.append(AuditEvent::new(AuditKind::LockoutTriggered, RiskLevel::High));
        audit.flush().await;

        let summary = audit.summary(Duration::hours(24)).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_kind.get(&AuditKind::LoginFailed), Some(&3));
        assert_eq!(summary.by_risk.get(&RiskLevel::High), Some(&1));
    }

    #[tokio::test]
    async fn query_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::spawn(dir.path());
        let events = audit.query(&AuditQuery::default()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::spawn(dir.path());
        audit.append(AuditEvent::new(AuditKind::LoginSuccess, RiskLevel::Low));
        audit.flush().await;

        let path = dir.path().join("audit.log");
        let mut data = std::fs::read_to_string(&path).unwrap();
        data.push_str("{not json\n");
        std::fs::write(&path, data).unwrap();

        let events = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
