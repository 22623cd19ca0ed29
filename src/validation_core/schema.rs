//! Fixed-shape validation schema
//!
//! Rule outcomes live in a fact table (one row per record × rule) so the table
//! layout never depends on the validator's rule set.

use super::types::{parse_datestamp, RuleId, ValidationRecord};
use rusqlite::{params, Connection, Row};

const CREATE_RECORD_VALIDATION: &str = "
    CREATE TABLE IF NOT EXISTS record_validation (
        identifier_hash TEXT PRIMARY KEY,
        identifier TEXT NOT NULL,
        datestamp TEXT,
        is_valid INTEGER NOT NULL,
        is_transformed INTEGER NOT NULL,
        published_metadata_hash TEXT
    )";

const CREATE_RULE_RESULTS: &str = "
    CREATE TABLE IF NOT EXISTS rule_results (
        identifier_hash TEXT NOT NULL
            REFERENCES record_validation(identifier_hash) ON DELETE CASCADE,
        rule_id INTEGER NOT NULL,
        is_valid INTEGER NOT NULL,
        PRIMARY KEY (identifier_hash, rule_id)
    ) WITHOUT ROWID";

const CREATE_SNAPSHOT_RULES: &str = "
    CREATE TABLE IF NOT EXISTS snapshot_rules (
        rule_id INTEGER PRIMARY KEY,
        position INTEGER NOT NULL
    )";

const CREATE_RULE_OCCURRENCES: &str = "
    CREATE TABLE IF NOT EXISTS rule_occurrences (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identifier_hash TEXT NOT NULL,
        rule_id INTEGER NOT NULL,
        is_valid INTEGER NOT NULL,
        occurrence_value TEXT
    )";

const RECORD_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_rv_identifier ON record_validation(identifier)",
    "CREATE INDEX IF NOT EXISTS idx_rv_valid ON record_validation(is_valid)",
    "CREATE INDEX IF NOT EXISTS idx_rv_transformed ON record_validation(is_transformed)",
    "CREATE INDEX IF NOT EXISTS idx_rr_rule ON rule_results(rule_id, is_valid)",
];

const OCCURRENCE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_ro_rule ON rule_occurrences(rule_id, is_valid)",
    "CREATE INDEX IF NOT EXISTS idx_ro_record ON rule_occurrences(identifier_hash)",
];

/// Create record, fact and rule tables; the occurrence ledger only when `detailed`
pub fn create_tables(conn: &Connection, detailed: bool) -> rusqlite::Result<()> {
    conn.execute(CREATE_RECORD_VALIDATION, [])?;
    conn.execute(CREATE_RULE_RESULTS, [])?;
    conn.execute(CREATE_SNAPSHOT_RULES, [])?;
    for index in RECORD_INDEXES {
        conn.execute(index, [])?;
    }

    if detailed {
        create_occurrence_table(conn)?;
    }

    log::debug!("VALIDATION DB: Created tables (detailed={})", detailed);
    Ok(())
}

pub fn create_occurrence_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(CREATE_RULE_OCCURRENCES, [])?;
    for index in OCCURRENCE_INDEXES {
        conn.execute(index, [])?;
    }
    Ok(())
}

pub fn has_occurrence_table(conn: &Connection) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'rule_occurrences'")?;
    stmt.exists([])
}

/// Replace the stored rule set, preserving the caller's order
pub fn store_rule_ids(conn: &mut Connection, rule_ids: &[RuleId]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM snapshot_rules", [])?;
    {
        let mut stmt = tx.prepare("INSERT INTO snapshot_rules (rule_id, position) VALUES (?1, ?2)")?;
        for (position, rule_id) in rule_ids.iter().enumerate() {
            stmt.execute(params![rule_id, position as i64])?;
        }
    }
    tx.commit()
}

pub fn load_rule_ids(conn: &Connection) -> rusqlite::Result<Vec<RuleId>> {
    let mut stmt = conn.prepare("SELECT rule_id FROM snapshot_rules ORDER BY position")?;
    let rows = stmt.query_map([], |row| row.get::<_, RuleId>(0))?;
    rows.collect()
}

pub fn count_records(conn: &Connection) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM record_validation", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Column list matching `record_from_row`, for a `record_validation` alias `r`
pub const RECORD_COLUMNS: &str =
    "r.identifier_hash, r.identifier, r.datestamp, r.is_valid, r.is_transformed, r.published_metadata_hash";

/// Basic record fields; rule results are attached separately
pub fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ValidationRecord> {
    let datestamp: Option<String> = row.get(2)?;
    Ok(ValidationRecord {
        identifier_hash: row.get(0)?,
        identifier: row.get(1)?,
        datestamp: datestamp.as_deref().and_then(parse_datestamp),
        is_valid: row.get(3)?,
        is_transformed: row.get(4)?,
        published_metadata_hash: row.get(5)?,
        rule_results: Default::default(),
    })
}

/// Fill `rule_results` from the fact table
pub fn attach_rule_results(conn: &Connection, record: &mut ValidationRecord) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("SELECT rule_id, is_valid FROM rule_results WHERE identifier_hash = ?1")?;
    let rows = stmt.query_map([&record.identifier_hash], |row| Ok((row.get::<_, RuleId>(0)?, row.get::<_, bool>(1)?)))?;
    for row in rows {
        let (rule_id, is_valid) = row?;
        record.rule_results.insert(rule_id, is_valid);
    }
    Ok(())
}
