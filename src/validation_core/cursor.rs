//! Streaming record cursor
//!
//! Owns a dedicated read-only connection and pages through the snapshot by
//! `identifier_hash` keyset, so at most one page is held in memory. The
//! connection is released on `close` or when the cursor is dropped, including
//! after an early break.

use super::schema;
use super::types::{SnapshotId, ValidationRecord};
use crate::error::{Result, StorageContext};
use rusqlite::{params, Connection};
use std::collections::VecDeque;

pub struct RecordCursor {
    snapshot_id: SnapshotId,
    conn: Option<Connection>,
    page_size: usize,
    buffer: VecDeque<ValidationRecord>,
    last_hash: Option<String>,
    exhausted: bool,
    yielded: u64,
}

impl RecordCursor {
    pub(crate) fn new(snapshot_id: SnapshotId, conn: Connection, page_size: usize) -> Self {
        Self {
            snapshot_id,
            conn: Some(conn),
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_hash: None,
            exhausted: false,
            yielded: 0,
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Records handed out so far
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Release the connection, surfacing any close failure
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.buffer.clear();
        self.exhausted = true;
        match self.conn.take() {
            Some(conn) => {
                log::debug!(
                    "VALIDATION REPO: Closing cursor for snapshot {} after {} records",
                    self.snapshot_id,
                    self.yielded
                );
                conn.close()
                    .map_err(|(_, e)| e)
                    .storage_context(|| "closing cursor connection".to_string())
            }
            None => Ok(()),
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_ref() else {
            self.exhausted = true;
            return Ok(());
        };

        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        // First page has no lower bound; an empty hash is a valid key
        let mut page = match self.last_hash.as_deref() {
            None => {
                let sql = format!(
                    "SELECT {} FROM record_validation r ORDER BY r.identifier_hash LIMIT ?1",
                    schema::RECORD_COLUMNS
                );
                let mut stmt = conn
                    .prepare_cached(&sql)
                    .storage_context(|| "preparing cursor page".to_string())?;
                let rows = stmt
                    .query_map(params![limit], schema::record_from_row)
                    .storage_context(|| format!("reading cursor page of snapshot {}", self.snapshot_id))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .storage_context(|| format!("reading cursor page of snapshot {}", self.snapshot_id))?
            }
            Some(after) => {
                let sql = format!(
                    "SELECT {} FROM record_validation r WHERE r.identifier_hash > ?1 ORDER BY r.identifier_hash LIMIT ?2",
                    schema::RECORD_COLUMNS
                );
                let mut stmt = conn
                    .prepare_cached(&sql)
                    .storage_context(|| "preparing cursor page".to_string())?;
                let rows = stmt
                    .query_map(params![after, limit], schema::record_from_row)
                    .storage_context(|| format!("reading cursor page of snapshot {}", self.snapshot_id))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .storage_context(|| format!("reading cursor page of snapshot {}", self.snapshot_id))?
            }
        };

        for record in &mut page {
            schema::attach_rule_results(conn, record).storage_context(|| "loading rule results".to_string())?;
        }

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_hash = Some(last.identifier_hash.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for RecordCursor {
    type Item = Result<ValidationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                // No further pages after a failed read
                if let Err(close_err) = self.release() {
                    log::warn!("VALIDATION REPO: {}", close_err);
                }
                return Some(Err(e));
            }
        }

        match self.buffer.pop_front() {
            Some(record) => {
                self.yielded += 1;
                Some(Ok(record))
            }
            None => {
                if let Err(e) = self.release() {
                    return Some(Err(e));
                }
                None
            }
        }
    }
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("VALIDATION REPO: {}", e);
        }
    }
}

impl std::fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCursor")
            .field("snapshot_id", &self.snapshot_id)
            .field("open", &self.conn.is_some())
            .field("yielded", &self.yielded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation_core::types::RuleId;

    fn seeded(n: usize, rules: &[RuleId]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("validation.db");
        let conn = Connection::open(&db_path).unwrap();
        schema::create_tables(&conn, false).unwrap();
        for i in 0..n {
            let hash = format!("h{:04}", i);
            conn.execute(
                "INSERT INTO record_validation (identifier_hash, identifier, is_valid, is_transformed) VALUES (?1, ?2, 1, 0)",
                params![hash, format!("oai:x:{}", i)],
            )
            .unwrap();
            for rule_id in rules {
                conn.execute(
                    "INSERT INTO rule_results (identifier_hash, rule_id, is_valid) VALUES (?1, ?2, 1)",
                    params![hash, rule_id],
                )
                .unwrap();
            }
        }
        (dir, db_path)
    }

    #[test]
    fn test_cursor_streams_every_record_in_hash_order() {
        let (_dir, db_path) = seeded(25, &[1, 2]);
        let cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 10);

        let records: Vec<_> = cursor.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 25);
        assert_eq!(records[0].identifier_hash, "h0000");
        assert_eq!(records[24].identifier_hash, "h0024");
        assert!(records.iter().all(|r| r.rule_results.len() == 2));
    }

    #[test]
    fn test_early_break_and_close() {
        let (_dir, db_path) = seeded(5, &[]);
        let mut cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 2);

        assert!(cursor.next().unwrap().is_ok());
        assert_eq!(cursor.yielded(), 1);
        cursor.close().unwrap();
    }

    #[test]
    fn test_empty_snapshot_ends_immediately() {
        let (_dir, db_path) = seeded(0, &[]);
        let mut cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 100);

        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_empty_hash_is_streamed() {
        let (_dir, db_path) = seeded(3, &[7]);
        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO record_validation (identifier_hash, identifier, is_valid, is_transformed) VALUES ('', 'oai:x:empty', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO rule_results (identifier_hash, rule_id, is_valid) VALUES ('', 7, 0)", [])
            .unwrap();

        let records: Vec<_> = RecordCursor::new(1, conn, 2).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].identifier_hash, "");
        assert_eq!(records[0].rule_results.get(&7), Some(&false));
    }

    #[test]
    fn test_failed_page_read_ends_stream() {
        let (_dir, db_path) = seeded(2, &[]);
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("DROP TABLE rule_results").unwrap();
        let mut cursor = RecordCursor::new(1, conn, 10);

        assert!(cursor.next().unwrap().is_err());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_exact_page_multiple() {
        let (_dir, db_path) = seeded(4, &[]);
        let cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 2);
        assert_eq!(cursor.count(), 4);
    }
}
