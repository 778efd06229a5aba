use std::path::PathBuf;

use crate::model::OperationState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid exclusion pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("package manager error: {message}")]
    PackageManager { message: String },

    #[error("cloud error: {message}")]
    Cloud { message: String },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationState,
        to: OperationState,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}
