#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    /// An append could not begin, write, or commit its transaction.
    #[error("store write failed: {0}")]
    Write(String),

    /// A stored key or value could not be decoded.
    #[error("corrupt record in {table}.{column}: {detail}")]
    CorruptRecord {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("sequence space exhausted")]
    SequenceExhausted,

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Write(_) => "write",
            Self::CorruptRecord { .. } => "corrupt_record",
            Self::SequenceExhausted => "sequence_exhausted",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_record_display() {
        let err = StoreError::CorruptRecord {
            table: "records",
            column: "key",
            detail: "invalid record key: \"abc\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt record in records.key: invalid record key: \"abc\""
        );
        assert_eq!(err.error_kind(), "corrupt_record");
    }

    #[test]
    fn rusqlite_error_maps_to_database() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
