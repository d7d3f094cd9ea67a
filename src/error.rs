use crate::models::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeedError>;

/// A rejected subscribe or order request. Answered to the sender only.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {reason}")]
pub struct ValidationError {
    pub code: ErrorCode,
    pub reason: String,
}

impl ValidationError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection {connection_id} failed: {reason}")]
    Connection { connection_id: u64, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection {connection_id} missed heartbeat for {silent_ms}ms")]
    Timeout { connection_id: u64, silent_ms: u64 },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("outbound queue full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connector is closed")]
    Closed,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl FeedError {
    /// Errors after which the caller must intervene manually.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::ReconnectExhausted { .. } | FeedError::Closed)
    }
}
