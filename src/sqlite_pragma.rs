//! Shared SQLite connection tuning

use rusqlite::Connection;

/// Apply the PRAGMA set every store connection runs with
///
/// WAL journaling, NORMAL sync, in-memory temp tables, page cache hint and a
/// 1000-page autocheckpoint.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode and wal_autocheckpoint answer with a row
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    let _pages: i64 = conn.pragma_update_and_check(None, "wal_autocheckpoint", 1000, |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Same as [`apply_optimized_pragmas`] plus `query_only`, for reader connections
pub fn apply_read_only_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    apply_optimized_pragmas(conn)?;
    // Must come after journal_mode, which writes to the database header
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();
        apply_optimized_pragmas(&conn).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i32 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, 1000);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        apply_read_only_pragmas(&conn).unwrap();
        assert!(conn.execute("INSERT INTO t (x) VALUES (1)", []).is_err());
    }
}
