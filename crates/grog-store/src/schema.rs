/// SQL DDL for the record log.
///
/// `records` is clustered on `key` (WITHOUT ROWID), so a key-range scan
/// walks rows in sequence order.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL
) WITHOUT ROWID;
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub const RECORDS_TABLE: &str = "records";
