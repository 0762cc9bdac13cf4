use grog_core::SessionId;
use grog_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The viewer sent something other than a cursor value.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0} is closed")]
    Closed(SessionId),

    /// Reading the window failed; `StoreError::CorruptRecord` lands here.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encode window: {0}")]
    Encode(#[from] serde_json::Error),

    /// The blocking refresh task panicked or was cancelled.
    #[error("refresh task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Transport(_) => "transport",
            Self::Closed(_) => "closed",
            Self::Store(e) => e.error_kind(),
            Self::Encode(_) => "encode",
            Self::Task(_) => "task",
        }
    }

    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, Self::Store(StoreError::CorruptRecord { .. }))
    }
}
