use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolDriveError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Confirmation error: {0}")]
    Confirmation(#[from] ConfirmationError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the single-slot confirmation channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmationError {
    #[error("another confirmation request is already active")]
    Busy,

    #[error("confirmation channel closed before a reply arrived")]
    Closed,

    #[error("no confirmation request is active")]
    NotActive,
}

pub type Result<T> = std::result::Result<T, ToolDriveError>;
