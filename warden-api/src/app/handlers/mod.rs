mod auth;
mod health;
mod sessions;
mod two_factor;
mod users;

pub use auth::{login, logout, refresh};
pub use health::health;
pub use sessions::{list_sessions, revoke_all_sessions, revoke_session};
pub use two_factor::{confirm_2fa, disable_2fa, setup_2fa};
pub use users::{change_password, create_user, delete_user, get_user, list_users, update_user};
