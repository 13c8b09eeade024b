//! 认证与用户管理 CLI 操作

use crossterm::style::Stylize;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ui::{print_error, print_header, print_kv, print_section, print_success, print_table_header};
use super::OutputFormat;
use crate::client::handle_error;

/// 用户摘要（从 API 返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub role: String,
    pub two_factor_enabled: bool,
    pub created_at: Option<String>,
}

/// 认证响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// 用户登录
pub async fn login(
    client: &Client,
    base: &str,
    username: &str,
    password: &str,
    two_factor_code: Option<&str>,
    output: OutputFormat,
) -> anyhow::Result<AuthToken> {
    let url = format!("{}/auth/login", base);
    let mut body = json!({
        "username": username,
        "password": password,
    });
    if let Some(code) = two_factor_code {
        body["two_factor_code"] = json!(code);
    }
    let resp = client.post(&url).json(&body).send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("login failed ({}): {}", status, body);
    }

    let token: AuthToken = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        OutputFormat::Table => {
            print_header("🔐 登录成功");
            println!();
            print_kv("Access Token", &token.access_token);
            print_kv("Refresh Token", &token.refresh_token);
            print_kv("Expires In", &format!("{} seconds", token.expires_in));
            println!();
            print_section("💡 提示");
            println!(
                "  设置环境变量以使用此 token: {}",
                "WD_TOKEN=<access_token>".cyan()
            );
        }
    }

    Ok(token)
}

/// 刷新 token
pub async fn refresh_token(
    client: &Client,
    base: &str,
    refresh_token: &str,
    output: OutputFormat,
) -> anyhow::Result<AuthToken> {
    let url = format!("{}/auth/refresh", base);
    let resp = client
        .post(&url)
        .json(&json!({"refresh_token": refresh_token}))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("refresh failed ({}): {}", status, body);
    }

    let token: AuthToken = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        OutputFormat::Table => {
            print_success("Token 刷新成功");
            print_kv("过期时间", &format!("{} 秒", token.expires_in));
        }
    }

    Ok(token)
}

/// 注销当前会话（或全部会话）
pub async fn logout(client: &Client, base: &str, all: bool) -> anyhow::Result<()> {
    let url = format!("{}/auth/logout", base);
    let resp = client.post(&url).json(&json!({"all": all})).send().await?;
    handle_error(resp).await?;
    print_success(if all {
        "已注销全部会话"
    } else {
        "已注销当前会话"
    });
    Ok(())
}

/// 列出所有用户
pub async fn list_users(client: &Client, base: &str, output: OutputFormat) -> anyhow::Result<()> {
    let url = format!("{}/users", base);
    let resp = client.get(&url).send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        print_error(&format!("获取用户列表失败 ({}): {}", status, body));
        return Ok(());
    }

    let users: Vec<UserSummary> = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        OutputFormat::Table => {
            print_header("👥 用户列表");
            if users.is_empty() {
                super::ui::print_empty("暂无用户");
                return Ok(());
            }
            print_table_header(&[("USERNAME", 20), ("ROLE", 8), ("2FA", 5), ("ID", 36)]);
            for user in &users {
                println!(
                    "  {:<20} {:<8} {:<5} {:<36}",
                    user.username,
                    user.role,
                    if user.two_factor_enabled { "on" } else { "off" },
                    user.id,
                );
            }
            println!();
        }
    }

    Ok(())
}

/// 获取用户详情
pub async fn get_user(
    client: &Client,
    base: &str,
    id: &str,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let url = format!("{}/users/{}", base, id);
    let resp = handle_error(client.get(&url).send().await?).await?;
    let user: UserSummary = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        OutputFormat::Table => {
            print_header("👤 用户详情");
            print_kv("ID", &user.id);
            print_kv("用户名", &user.username);
            print_kv("角色", &user.role);
            print_kv("2FA", if user.two_factor_enabled { "启用" } else { "未启用" });
            if let Some(created) = &user.created_at {
                print_kv("创建时间", created);
            }
            println!();
        }
    }

    Ok(())
}

/// 创建用户
pub async fn create_user(
    client: &Client,
    base: &str,
    username: &str,
    password: &str,
    admin: bool,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let url = format!("{}/users", base);
    let resp = client
        .post(&url)
        .json(&json!({
            "username": username,
            "password": password,
            "role": if admin { "admin" } else { "user" },
        }))
        .send()
        .await?;
    let resp = handle_error(resp).await?;
    let user: UserSummary = resp.json().await?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        OutputFormat::Table => {
            print_success(&format!("用户 {} 创建成功", user.username));
            print_kv("ID", &user.id);
        }
    }

    Ok(())
}

/// 删除用户
pub async fn delete_user(client: &Client, base: &str, id: &str) -> anyhow::Result<()> {
    let url = format!("{}/users/{}", base, id);
    let resp = client.delete(&url).send().await?;
    handle_error(resp).await?;
    print_success(&format!("用户 {} 已删除", id));
    Ok(())
}

/// 更新用户密码
pub async fn update_user_password(
    client: &Client,
    base: &str,
    id: &str,
    password: &str,
    current: Option<&str>,
) -> anyhow::Result<()> {
    let url = format!("{}/users/{}/password", base, id);
    let mut body = json!({"new_password": password});
    if let Some(current) = current {
        body["current_password"] = json!(current);
    }
    let resp = client.post(&url).json(&body).send().await?;
    handle_error(resp).await?;
    print_success("密码修改成功（该用户全部会话已注销）");
    Ok(())
}
