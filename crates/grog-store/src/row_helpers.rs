use grog_core::{RecordKind, Sequence};

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRecord on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRecord {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Decode a fixed-width key back into its sequence.
pub fn parse_sequence_key(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<Sequence, StoreError> {
    Sequence::from_key(raw).map_err(|e| StoreError::CorruptRecord {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a stored kind tag.
pub fn parse_kind(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<RecordKind, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRecord {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}
