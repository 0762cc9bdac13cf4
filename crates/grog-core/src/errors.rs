/// Decoding failures for values that cross a text boundary
/// (store keys, viewer cursor messages, stored kind tags).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid sequence: {0:?}")]
    InvalidSequence(String),

    #[error("invalid record key: {0:?}")]
    InvalidKey(String),

    #[error("unknown record kind: {0:?}")]
    UnknownKind(String),
}

impl CoreError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidSequence(_) => "invalid_sequence",
            Self::InvalidKey(_) => "invalid_key",
            Self::UnknownKind(_) => "unknown_kind",
        }
    }
}
