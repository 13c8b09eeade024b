//! 会话生命周期：创建、校验、撤销与并发上限驱逐

mod models;
mod registry;

pub use models::{DeviceInfo, Session, SessionSummary};
pub use registry::{
    SessionRegistry, DEFAULT_MAX_SESSIONS_PER_USER, REASON_LOGOUT, REASON_MAX_SESSIONS,
    REASON_PASSWORD_CHANGED, REASON_ROTATED,
};
