mod client;
mod ops;

use clap::{Parser, Subcommand};
use ops::{
    clear_sessions, create_user, delete_user, get_user, list_sessions, list_users, login, logout,
    refresh_token, revoke_session, update_user_password, OutputFormat,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI wrapper around the Warden HTTP API.
#[derive(Parser)]
#[command(name = "warden-cli", author, version, about = "CLI for Warden API")]
struct Cli {
    /// API base url
    #[arg(long, env = "WD_API_BASE", default_value = "http://127.0.0.1:8080")]
    api_base: String,

    /// Bearer token for authentication
    #[arg(long, env = "WD_TOKEN")]
    token: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ==================== 认证 ====================
    /// 用户登录，获取 access token
    Login {
        /// 用户名
        #[arg(long, short)]
        username: String,
        /// 密码
        #[arg(long, short)]
        password: String,
        /// 2FA 验证码或备份码（已启用 2FA 的账号必填）
        #[arg(long, short = 'c')]
        code: Option<String>,
    },
    /// 刷新 access token
    Refresh {
        /// Refresh token
        #[arg(long, short)]
        refresh_token: String,
    },
    /// 注销当前会话
    Logout {
        /// 注销全部会话
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    // ==================== 会话 ====================
    /// 会话管理命令
    #[command(subcommand)]
    Session(SessionCommands),

    // ==================== 用户管理（仅管理员）====================
    /// 用户管理命令
    #[command(subcommand)]
    User(UserCommands),
}

#[derive(Subcommand)]
enum SessionCommands {
    /// 列出当前用户的活跃会话
    List,
    /// 撤销指定会话
    Revoke {
        /// 会话 ID (jti)
        id: String,
    },
    /// 撤销当前用户的全部会话
    Clear,
}

#[derive(Subcommand)]
enum UserCommands {
    /// 列出所有用户
    List,
    /// 获取用户详情
    Get {
        /// 用户 ID
        id: String,
    },
    /// 创建用户
    Create {
        /// 用户名
        #[arg(long, short)]
        username: String,
        /// 密码
        #[arg(long, short)]
        password: String,
        /// 授予管理员角色
        #[arg(long, default_value_t = false)]
        admin: bool,
    },
    /// 删除用户
    Delete {
        /// 用户 ID
        id: String,
    },
    /// 更新用户密码
    Password {
        /// 用户 ID
        id: String,
        /// 新密码
        #[arg(long, short)]
        password: String,
        /// 当前密码（非管理员必填）
        #[arg(long)]
        current: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载 .env 文件（如果存在），忽略错误
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let client = client::build_client(&cli.token)?;

    match cli.command {
        // 认证命令
        Commands::Login {
            username,
            password,
            code,
        } => {
            login(
                &client,
                &cli.api_base,
                &username,
                &password,
                code.as_deref(),
                cli.output,
            )
            .await?;
        }
        Commands::Refresh { refresh_token: rt } => {
            refresh_token(&client, &cli.api_base, &rt, cli.output).await?;
        }
        Commands::Logout { all } => logout(&client, &cli.api_base, all).await?,

        // 会话命令
        Commands::Session(session_cmd) => match session_cmd {
            SessionCommands::List => list_sessions(&client, &cli.api_base, cli.output).await?,
            SessionCommands::Revoke { id } => revoke_session(&client, &cli.api_base, &id).await?,
            SessionCommands::Clear => clear_sessions(&client, &cli.api_base).await?,
        },

        // 用户管理命令
        Commands::User(user_cmd) => match user_cmd {
            UserCommands::List => list_users(&client, &cli.api_base, cli.output).await?,
            UserCommands::Get { id } => get_user(&client, &cli.api_base, &id, cli.output).await?,
            UserCommands::Create {
                username,
                password,
                admin,
            } => {
                create_user(
                    &client,
                    &cli.api_base,
                    &username,
                    &password,
                    admin,
                    cli.output,
                )
                .await?
            }
            UserCommands::Delete { id } => delete_user(&client, &cli.api_base, &id).await?,
            UserCommands::Password {
                id,
                password,
                current,
            } => {
                update_user_password(&client, &cli.api_base, &id, &password, current.as_deref())
                    .await?
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses() {
        let args = ["warden", "session", "list"];
        let _ = Cli::parse_from(args);
    }

    #[test]
    fn clap_parses_login_with_code() {
        let args = [
            "warden", "login", "-u", "alice", "-p", "secret", "-c", "123456",
        ];
        let _ = Cli::parse_from(args);
    }
}
