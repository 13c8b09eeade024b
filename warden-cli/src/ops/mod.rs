mod output;
mod sessions;
mod ui;
mod users;

pub use output::OutputFormat;
pub use sessions::{clear_sessions, list_sessions, revoke_session};
pub use users::{
    create_user, delete_user, get_user, list_users, login, logout, refresh_token,
    update_user_password,
};
