//! Occurrence ledger
//!
//! Present only for snapshots validated in detailed mode. Every read degrades
//! to an empty result when the table was never created.

use super::filter::RecordFilter;
use super::schema;
use super::types::{OccurrenceCount, RuleId, RuleOccurrence, RuleOccurrenceCounts};
use crate::error::{Result, StorageContext};
use rusqlite::{params, params_from_iter, Connection};

const INSERT_OCCURRENCE: &str =
    "INSERT INTO rule_occurrences (identifier_hash, rule_id, is_valid, occurrence_value) VALUES (?1, ?2, ?3, ?4)";

/// Append occurrence rows on an open connection or transaction
pub fn insert_occurrences(conn: &Connection, occurrences: &[RuleOccurrence], batch_size: usize) -> rusqlite::Result<()> {
    if occurrences.is_empty() {
        return Ok(());
    }

    let mut stmt = conn.prepare_cached(INSERT_OCCURRENCE)?;
    for chunk in occurrences.chunks(batch_size.max(1)) {
        for occurrence in chunk {
            stmt.execute(params![
                occurrence.identifier_hash,
                occurrence.rule_id,
                occurrence.is_valid,
                occurrence.occurrence_value,
            ])?;
        }
        log::debug!("OCCURRENCE REPO: Wrote {} occurrences", chunk.len());
    }
    Ok(())
}

/// Distinct values for one rule and outcome, most frequent first
///
/// Ties keep first-seen order. Only records matching `filter` contribute.
pub fn count_by_rule_and_validity(
    conn: &Connection,
    rule_id: RuleId,
    is_valid: bool,
    filter: &RecordFilter,
) -> Result<Vec<OccurrenceCount>> {
    if !schema::has_occurrence_table(conn).storage_context(|| "inspecting schema".to_string())? {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT o.occurrence_value, COUNT(*) AS cnt, MIN(o.id) AS first_seen \
         FROM rule_occurrences o WHERE o.rule_id = ? AND o.is_valid = ?",
    );
    let mut values: Vec<rusqlite::types::Value> = vec![rule_id.into(), (is_valid as i64).into()];
    if !filter.is_empty() {
        let condition = filter.to_sql();
        sql.push_str(" AND o.identifier_hash IN (SELECT r.identifier_hash FROM record_validation r WHERE ");
        sql.push_str(&condition.sql);
        sql.push(')');
        values.extend(condition.params);
    }
    sql.push_str(" GROUP BY o.occurrence_value ORDER BY cnt DESC, first_seen ASC");

    let mut stmt = conn
        .prepare(&sql)
        .storage_context(|| format!("preparing occurrence counts for rule {}", rule_id))?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let count: i64 = row.get(1)?;
            Ok(OccurrenceCount {
                value: row.get(0)?,
                count: count.max(0) as u64,
            })
        })
        .storage_context(|| format!("counting occurrences for rule {}", rule_id))?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .storage_context(|| format!("reading occurrence counts for rule {}", rule_id))
}

/// Valid and invalid drill-down lists for one rule
pub fn rule_occurrence_counts(conn: &Connection, rule_id: RuleId, filter: &RecordFilter) -> Result<RuleOccurrenceCounts> {
    let counts = RuleOccurrenceCounts {
        valid_rule_occrs: count_by_rule_and_validity(conn, rule_id, true, filter)?,
        invalid_rule_occrs: count_by_rule_and_validity(conn, rule_id, false, filter)?,
    };
    log::debug!(
        "OCCURRENCE REPO: Rule {} has {} valid / {} invalid distinct values",
        rule_id,
        counts.valid_rule_occrs.len(),
        counts.invalid_rule_occrs.len()
    );
    Ok(counts)
}

/// Occurrence rows of one record in insertion order
pub fn occurrences_by_record(conn: &Connection, identifier_hash: &str) -> Result<Vec<RuleOccurrence>> {
    if !schema::has_occurrence_table(conn).storage_context(|| "inspecting schema".to_string())? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare_cached(
            "SELECT identifier_hash, rule_id, is_valid, occurrence_value \
             FROM rule_occurrences WHERE identifier_hash = ?1 ORDER BY id",
        )
        .storage_context(|| "preparing occurrence lookup".to_string())?;
    let rows = stmt
        .query_map([identifier_hash], |row| {
            Ok(RuleOccurrence {
                identifier_hash: row.get(0)?,
                rule_id: row.get(1)?,
                is_valid: row.get(2)?,
                occurrence_value: row.get(3)?,
            })
        })
        .storage_context(|| format!("loading occurrences of {}", identifier_hash))?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .storage_context(|| format!("reading occurrences of {}", identifier_hash))
}
