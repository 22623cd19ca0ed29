//! Record repository: batched transactional writes and point lookups
//!
//! A batch is written in one transaction. Counters in the accumulator move
//! only after the commit succeeds, so they never run ahead of the rows.

use super::lifecycle::OpenStore;
use super::occurrences;
use super::schema;
use super::stats::SnapshotValidationStats;
use super::types::{format_datestamp, RuleId, RuleOccurrence, ValidationRecord};
use crate::error::{Result, StatsError, StorageContext};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::time::Instant;

const INSERT_RECORD: &str = "INSERT INTO record_validation
    (identifier_hash, identifier, datestamp, is_valid, is_transformed, published_metadata_hash)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_FACT: &str = "INSERT INTO rule_results (identifier_hash, rule_id, is_valid) VALUES (?1, ?2, ?3)";

/// Replace the rule set of a snapshot that has not received records yet
///
/// Re-registering the same set later is a no-op; a different set once
/// records exist is a `SchemaMismatch`.
pub fn register_rule_ids(store: &mut OpenStore, rule_ids: &[RuleId]) -> Result<()> {
    let snapshot_id = store.snapshot_id;
    let requested: BTreeSet<RuleId> = rule_ids.iter().copied().collect();
    if requested == store.rule_set() {
        return Ok(());
    }

    let ws = store.write_state_mut()?;
    if ws.stats.total_records > 0 || ws.has_pending() {
        return Err(StatsError::SchemaMismatch {
            snapshot_id,
            detail: format!(
                "cannot change rule set to {:?} after records were written",
                requested
            ),
        });
    }

    let mut ordered = Vec::with_capacity(requested.len());
    let mut seen = BTreeSet::new();
    for rule_id in rule_ids {
        if seen.insert(*rule_id) {
            ordered.push(*rule_id);
        }
    }

    schema::store_rule_ids(&mut store.conn, &ordered)
        .storage_context(|| format!("registering rule ids for snapshot {}", snapshot_id))?;
    store.write_state_mut()?.stats = SnapshotValidationStats::with_rules(&ordered);
    log::info!(
        "VALIDATION REPO: Registered {} rules for snapshot {}",
        ordered.len(),
        snapshot_id
    );
    store.rule_ids = ordered;
    Ok(())
}

/// Every record must carry an outcome for exactly the registered rules
pub(crate) fn check_rule_sets(store: &OpenStore, records: &[ValidationRecord]) -> Result<()> {
    let registered = store.rule_set();
    for record in records {
        if record.rule_results.len() == registered.len()
            && record.rule_results.keys().all(|rule_id| registered.contains(rule_id))
        {
            continue;
        }

        let present: BTreeSet<RuleId> = record.rule_results.keys().copied().collect();
        let missing: Vec<_> = registered.difference(&present).collect();
        let unexpected: Vec<_> = present.difference(&registered).collect();
        return Err(StatsError::SchemaMismatch {
            snapshot_id: store.snapshot_id,
            detail: format!(
                "record {} is missing rules {:?} and has unregistered rules {:?}",
                record.identifier_hash, missing, unexpected
            ),
        });
    }
    Ok(())
}

/// Write records and occurrences together, all or nothing
pub fn write_batch(
    store: &mut OpenStore,
    records: &[ValidationRecord],
    occurrence_rows: &[RuleOccurrence],
    batch_size: usize,
) -> Result<()> {
    store.write_state_mut()?;
    if records.is_empty() && occurrence_rows.is_empty() {
        return Ok(());
    }
    check_rule_sets(store, records)?;

    let snapshot_id = store.snapshot_id;
    if !occurrence_rows.is_empty() && !store.detailed {
        schema::create_occurrence_table(&store.conn)
            .storage_context(|| format!("creating occurrence table for snapshot {}", snapshot_id))?;
        store.detailed = true;
    }

    let started = Instant::now();
    if let Err(e) = write_in_transaction(&mut store.conn, records, occurrence_rows, batch_size) {
        log::warn!(
            "VALIDATION REPO: Rolled back batch of {} records for snapshot {}: {}",
            records.len(),
            snapshot_id,
            e
        );
        return Err(StatsError::storage(
            format!("writing batch for snapshot {}", snapshot_id),
            e,
        ));
    }

    let ws = store.write_state_mut()?;
    for record in records {
        ws.stats.update_from_record(record);
    }

    log::debug!(
        "VALIDATION REPO: Committed {} records, {} occurrences for snapshot {} in {:?}",
        records.len(),
        occurrence_rows.len(),
        snapshot_id,
        started.elapsed()
    );
    Ok(())
}

pub fn insert_batch(store: &mut OpenStore, records: &[ValidationRecord], batch_size: usize) -> Result<()> {
    write_batch(store, records, &[], batch_size)
}

pub fn insert(store: &mut OpenStore, record: &ValidationRecord) -> Result<()> {
    write_batch(store, std::slice::from_ref(record), &[], 1)
}

fn write_in_transaction(
    conn: &mut Connection,
    records: &[ValidationRecord],
    occurrence_rows: &[RuleOccurrence],
    batch_size: usize,
) -> rusqlite::Result<()> {
    // Dropping the transaction on error rolls it back
    let tx = conn.transaction()?;
    {
        let mut record_stmt = tx.prepare_cached(INSERT_RECORD)?;
        let mut fact_stmt = tx.prepare_cached(INSERT_FACT)?;

        for chunk in records.chunks(batch_size.max(1)) {
            for record in chunk {
                record_stmt.execute(params![
                    record.identifier_hash,
                    record.identifier,
                    record.datestamp.as_ref().map(format_datestamp),
                    record.is_valid,
                    record.is_transformed,
                    record.published_metadata_hash,
                ])?;
                for (rule_id, is_valid) in &record.rule_results {
                    fact_stmt.execute(params![record.identifier_hash, rule_id, is_valid])?;
                }
            }
            log::debug!("VALIDATION REPO: Wrote chunk of {} records", chunk.len());
        }

        occurrences::insert_occurrences(&tx, occurrence_rows, batch_size)?;
    }
    tx.commit()
}

/// Records that passed (or failed) one rule, ordered by identifier
pub fn query_by_rule(
    conn: &Connection,
    rule_id: RuleId,
    is_valid: bool,
    offset: usize,
    limit: usize,
) -> Result<Vec<ValidationRecord>> {
    let sql = format!(
        "SELECT {} FROM record_validation r
         JOIN rule_results f ON f.identifier_hash = r.identifier_hash
         WHERE f.rule_id = ?1 AND f.is_valid = ?2
         ORDER BY r.identifier, r.identifier_hash LIMIT ?3 OFFSET ?4",
        schema::RECORD_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .storage_context(|| format!("preparing query for rule {}", rule_id))?;
    let rows = stmt
        .query_map(params![rule_id, is_valid, limit as i64, offset as i64], schema::record_from_row)
        .storage_context(|| format!("querying records for rule {}", rule_id))?;

    let mut records = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage_context(|| format!("reading records for rule {}", rule_id))?;
    for record in &mut records {
        schema::attach_rule_results(conn, record).storage_context(|| "loading rule results".to_string())?;
    }
    Ok(records)
}

/// Look a record up by its OAI identifier
pub fn get_by_identifier(conn: &Connection, identifier: &str) -> Result<Option<ValidationRecord>> {
    let sql = format!(
        "SELECT {} FROM record_validation r WHERE r.identifier = ?1 ORDER BY r.identifier_hash LIMIT 1",
        schema::RECORD_COLUMNS
    );
    let mut stmt = conn
        .prepare_cached(&sql)
        .storage_context(|| "preparing identifier lookup".to_string())?;
    let mut rows = stmt
        .query_map([identifier], schema::record_from_row)
        .storage_context(|| format!("looking up {}", identifier))?;

    match rows.next() {
        Some(row) => {
            let mut record = row.storage_context(|| format!("reading {}", identifier))?;
            schema::attach_rule_results(conn, &mut record)
                .storage_context(|| "loading rule results".to_string())?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}
