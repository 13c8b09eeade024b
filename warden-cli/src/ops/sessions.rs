//! 会话管理 CLI 操作

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::ui::{print_empty, print_header, print_success, print_table_header};
use super::OutputFormat;
use crate::client::handle_error;

/// 会话摘要（从 API 返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub device: DeviceInfo,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub ip: String,
    pub fingerprint: String,
}

/// 列出当前用户的活跃会话
pub async fn list_sessions(client: &Client, base: &str, output: OutputFormat) -> anyhow::Result<()> {
    let url = format!("{}/sessions", base);
    let resp = handle_error(client.get(&url).send().await?).await?;
    let sessions: Vec<SessionSummary> = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        OutputFormat::Table => {
            print_header("💻 活跃会话");
            if sessions.is_empty() {
                print_empty("没有活跃会话");
                return Ok(());
            }
            print_table_header(&[("IP", 16), ("DEVICE", 28), ("CREATED", 20), ("ID", 36)]);
            for session in &sessions {
                let mut agent = session.device.user_agent.clone();
                if agent.len() > 26 {
                    agent.truncate(26);
                    agent.push('…');
                }
                println!(
                    "  {:<16} {:<28} {:<20} {:<36}",
                    session.device.ip, agent, session.created_at, session.id,
                );
            }
            println!();
        }
    }

    Ok(())
}

/// 撤销单个会话
pub async fn revoke_session(client: &Client, base: &str, jti: &str) -> anyhow::Result<()> {
    let url = format!("{}/sessions/{}", base, jti);
    let resp = client.delete(&url).send().await?;
    handle_error(resp).await?;
    print_success(&format!("会话 {} 已撤销", jti));
    Ok(())
}

/// 撤销当前用户的全部会话
pub async fn clear_sessions(client: &Client, base: &str) -> anyhow::Result<()> {
    let url = format!("{}/sessions", base);
    let resp = client.delete(&url).send().await?;
    handle_error(resp).await?;
    print_success("全部会话已撤销");
    Ok(())
}
