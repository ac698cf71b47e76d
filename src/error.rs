//! Error types for the sync layer and for user-facing validation.

use thiserror::Error;

use crate::models::SyncStatus;

/// Failures of the local store, the remote service and startup configuration.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request never reached the service.
    #[error("network failure: {0}")]
    Network(String),

    /// The service answered with an error (constraint violation, auth, ...).
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// A payload could not be decoded.
    #[error("malformed payload: {0}")]
    Parse(String),

    /// Endpoint URL or access key absent at startup.
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("local store: {0}")]
    LocalStore(String),
}

impl SyncError {
    /// Status shown after a remote call failed with this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            SyncError::Network(_) => SyncStatus::Offline,
            SyncError::Rejected { .. } | SyncError::Parse(_) => SyncStatus::Conflict,
            SyncError::MissingConfiguration(_) | SyncError::LocalStore(_) => SyncStatus::Offline,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::LocalStore(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Parse(e.to_string())
    }
}

/// Rejected user input. The message is what the staff member sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("担当者を1名以上入力してください")]
    EmptyStaffList,

    #[error("有効なHTTPS URLを入力してください")]
    InsecureUrl,

    #[error("発注データがありません。発注を確定できません。")]
    NothingToConfirm,

    #[error("JSON形式が正しくありません")]
    NotAVendorArray,

    #[error("JSONの読み込みに失敗しました: {0}")]
    InvalidJson(String),

    #[error("日付の形式が正しくありません: {0}")]
    InvalidDate(String),

    #[error("担当者リストにありません: {0}")]
    UnknownStaff(String),
}
