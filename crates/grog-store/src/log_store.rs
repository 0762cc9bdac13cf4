use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use grog_core::{LogRecord, RecordKind, Sequence};
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema::RECORDS_TABLE;

/// Sequencer and ordered record store.
///
/// Every append runs under the database connection lock, so sequence
/// assignment is serialized across all clones of a `LogStore`. The head
/// only advances after a successful commit: a failed append consumes no
/// sequence and leaves nothing visible.
#[derive(Clone)]
pub struct LogStore {
    db: Database,
    head: Arc<AtomicU64>,
}

impl LogStore {
    /// Wrap a database, resuming the sequence from the highest stored key.
    pub fn open(db: Database) -> Result<Self, StoreError> {
        let max_key: Option<String> = db.with_conn(|conn| {
            Ok(conn.query_row("SELECT MAX(key) FROM records", [], |row| row.get(0))?)
        })?;
        let head = match max_key {
            Some(key) => row_helpers::parse_sequence_key(&key, RECORDS_TABLE, "key")?,
            None => Sequence::ZERO,
        };

        Ok(Self {
            db,
            head: Arc::new(AtomicU64::new(head.get())),
        })
    }

    /// Sequence of the most recently committed record (0 when empty).
    pub fn head(&self) -> Sequence {
        Sequence::new(self.head.load(Ordering::Acquire))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Durably persist one line and return its sequence.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn append(&self, payload: &[u8], kind: RecordKind) -> Result<Sequence, StoreError> {
        self.db.with_conn_mut(|conn| {
            let next = self
                .head()
                .next()
                .ok_or(StoreError::SequenceExhausted)?;

            let tx = conn
                .transaction()
                .map_err(|e| StoreError::Write(format!("begin transaction: {e}")))?;
            tx.execute(
                "INSERT INTO records (key, kind, payload) VALUES (?1, ?2, ?3)",
                rusqlite::params![next.to_key(), kind.as_str(), payload],
            )
            .map_err(|e| StoreError::Write(format!("insert: {e}")))?;
            tx.commit()
                .map_err(|e| StoreError::Write(format!("commit: {e}")))?;

            self.head.store(next.get(), Ordering::Release);
            debug!(sequence = %next, "record appended");
            Ok(next)
        })
    }

    /// Up to `limit` records with sequence >= `from`, ascending.
    #[instrument(skip(self))]
    pub fn read_range(&self, from: Sequence, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key, kind, payload FROM records
                 WHERE key >= ?1
                 ORDER BY key ASC
                 LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut rows = stmt.query(rusqlite::params![from.to_key(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<LogRecord, StoreError> {
    let key: String = row_helpers::get(row, 0, RECORDS_TABLE, "key")?;
    let kind: String = row_helpers::get(row, 1, RECORDS_TABLE, "kind")?;

    Ok(LogRecord {
        sequence: row_helpers::parse_sequence_key(&key, RECORDS_TABLE, "key")?,
        kind: row_helpers::parse_kind(&kind, RECORDS_TABLE, "kind")?,
        payload: row_helpers::get(row, 2, RECORDS_TABLE, "payload")?,
    })
}
