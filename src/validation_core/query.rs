//! Aggregate and listing queries over one snapshot's store
//!
//! Filtered aggregates are pushed down to SQL; `aggregate_by_scan` computes the
//! same result by streaming records through the in-memory accumulator.

use super::filter::RecordFilter;
use super::schema;
use super::stats::{
    bool_facet_value, SnapshotValidationStats, FACET_INVALID_RULES, FACET_RECORD_IS_TRANSFORMED,
    FACET_RECORD_IS_VALID, FACET_VALID_RULES,
};
use super::types::{Page, RuleId, SnapshotId, ValidationObservation, ValidationRecord};
use crate::error::{Result, StorageContext};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::time::Instant;

fn to_count(raw: i64) -> u64 {
    raw.max(0) as u64
}

/// Recompute totals, per-rule counts and facets for records matching `filter`
pub fn aggregate_stats(conn: &Connection, rule_ids: &[RuleId], filter: &RecordFilter) -> Result<SnapshotValidationStats> {
    let started = Instant::now();
    let condition = filter.to_sql();

    let (total, valid, transformed): (i64, i64, i64) = conn
        .query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(r.is_valid), 0), COALESCE(SUM(r.is_transformed), 0)
                 FROM record_validation r WHERE {}",
                condition.sql
            ),
            params_from_iter(condition.params.iter()),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .storage_context(|| "counting matching records".to_string())?;

    let mut stats = SnapshotValidationStats::with_rules(rule_ids);
    stats.total_records = to_count(total);
    stats.valid_records = to_count(valid);
    stats.transformed_records = to_count(transformed);

    stats.add_facet_count(FACET_RECORD_IS_VALID, bool_facet_value(true), stats.valid_records);
    stats.add_facet_count(FACET_RECORD_IS_VALID, bool_facet_value(false), stats.invalid_records());
    stats.add_facet_count(FACET_RECORD_IS_TRANSFORMED, bool_facet_value(true), stats.transformed_records);
    stats.add_facet_count(
        FACET_RECORD_IS_TRANSFORMED,
        bool_facet_value(false),
        stats.total_records.saturating_sub(stats.transformed_records),
    );

    let mut stmt = conn
        .prepare(&format!(
            "SELECT f.rule_id, SUM(f.is_valid), SUM(1 - f.is_valid)
             FROM rule_results f JOIN record_validation r ON r.identifier_hash = f.identifier_hash
             WHERE {} GROUP BY f.rule_id",
            condition.sql
        ))
        .storage_context(|| "preparing rule aggregation".to_string())?;
    let rows = stmt
        .query_map(params_from_iter(condition.params.iter()), |row| {
            Ok((row.get::<_, RuleId>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })
        .storage_context(|| "aggregating rule results".to_string())?;

    for row in rows {
        let (rule_id, valid_count, invalid_count) = row.storage_context(|| "reading rule aggregation".to_string())?;
        let counters = stats.rule_stats.entry(rule_id).or_default();
        counters.valid_count = to_count(valid_count);
        counters.invalid_count = to_count(invalid_count);

        let key = rule_id.to_string();
        stats.add_facet_count(FACET_VALID_RULES, &key, to_count(valid_count));
        stats.add_facet_count(FACET_INVALID_RULES, &key, to_count(invalid_count));
    }

    log::debug!(
        "STATS: Aggregated {} matching records ({} filter terms) in {:?}",
        stats.total_records,
        filter.terms().len(),
        started.elapsed()
    );
    Ok(stats)
}

/// Same result as `aggregate_stats`, computed by a single streaming pass
pub fn aggregate_by_scan<I>(records: I, rule_ids: &[RuleId], filter: &RecordFilter) -> Result<SnapshotValidationStats>
where
    I: IntoIterator<Item = Result<ValidationRecord>>,
{
    let mut stats = SnapshotValidationStats::with_rules(rule_ids);
    for record in records {
        let record = record?;
        if filter.matches(&record) {
            stats.update_from_record(&record);
        }
    }
    Ok(stats)
}

/// Count of records matching `filter`
pub fn count_matching(conn: &Connection, filter: &RecordFilter) -> Result<u64> {
    let condition = filter.to_sql();
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM record_validation r WHERE {}", condition.sql),
            params_from_iter(condition.params.iter()),
            |row| row.get(0),
        )
        .storage_context(|| "counting matching records".to_string())?;
    Ok(to_count(count))
}

/// Zero-based page of matching records ordered by identifier
pub fn query_page(
    conn: &Connection,
    snapshot_id: SnapshotId,
    filter: &RecordFilter,
    page: usize,
    size: usize,
) -> Result<Page<ValidationObservation>> {
    let size = size.max(1);
    let total = count_matching(conn, filter)?;
    let limit = i64::try_from(size).unwrap_or(i64::MAX);
    let offset = i64::try_from(page.saturating_mul(size)).unwrap_or(i64::MAX);

    let condition = filter.to_sql();
    let sql = format!(
        "SELECT {} FROM record_validation r WHERE {}
         ORDER BY r.identifier, r.identifier_hash LIMIT ? OFFSET ?",
        schema::RECORD_COLUMNS,
        condition.sql
    );
    let mut bound = condition.params.clone();
    bound.push(Value::Integer(limit));
    bound.push(Value::Integer(offset));
    let mut stmt = conn
        .prepare(&sql)
        .storage_context(|| "preparing paginated listing".to_string())?;
    let rows = stmt
        .query_map(params_from_iter(bound.iter()), schema::record_from_row)
        .storage_context(|| "listing records".to_string())?;
    let mut records = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage_context(|| "reading listed records".to_string())?;

    let mut items = Vec::with_capacity(records.len());
    for record in &mut records {
        schema::attach_rule_results(conn, record).storage_context(|| "loading rule results".to_string())?;
        items.push(ValidationObservation::from_record(snapshot_id, record));
    }

    log::debug!(
        "VALIDATION REPO: Page {} (size {}) of snapshot {}: {} of {} records",
        page,
        size,
        snapshot_id,
        items.len(),
        total
    );
    Ok(Page { items, total, page, size })
}

/// Basic record fields ordered by identifier hash, without rule results
pub fn page_by_hash(conn: &Connection, offset: u64, limit: usize) -> Result<Vec<ValidationRecord>> {
    let sql = format!(
        "SELECT {} FROM record_validation r ORDER BY r.identifier_hash LIMIT ?1 OFFSET ?2",
        schema::RECORD_COLUMNS
    );
    let mut stmt = conn
        .prepare_cached(&sql)
        .storage_context(|| "preparing record page".to_string())?;
    let rows = stmt
        .query_map([limit as i64, offset as i64], schema::record_from_row)
        .storage_context(|| "reading record page".to_string())?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .storage_context(|| "reading record page".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation_core::cursor::RecordCursor;
    use rusqlite::params;

    fn insert(conn: &Connection, hash: &str, identifier: &str, valid: bool, transformed: bool, rules: &[(RuleId, bool)]) {
        conn.execute(
            "INSERT INTO record_validation (identifier_hash, identifier, is_valid, is_transformed) VALUES (?1, ?2, ?3, ?4)",
            params![hash, identifier, valid, transformed],
        )
        .unwrap();
        for (rule_id, ok) in rules {
            conn.execute(
                "INSERT INTO rule_results (identifier_hash, rule_id, is_valid) VALUES (?1, ?2, ?3)",
                params![hash, rule_id, ok],
            )
            .unwrap();
        }
    }

    fn seeded() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("validation.db");
        let conn = Connection::open(&db_path).unwrap();
        schema::create_tables(&conn, false).unwrap();
        insert(&conn, "ha", "oai:repo:a", true, false, &[(10, true), (11, true)]);
        insert(&conn, "hb", "oai:repo:b", false, true, &[(10, true), (11, false)]);
        insert(&conn, "hc", "oai:other:c", false, false, &[(10, false), (11, false)]);
        (dir, db_path)
    }

    #[test]
    fn test_unfiltered_aggregate() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();

        let stats = aggregate_stats(&conn, &[10, 11], &RecordFilter::none()).unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.valid_records, 1);
        assert_eq!(stats.transformed_records, 1);
        assert_eq!(stats.rule(10).unwrap().valid_count, 2);
        assert_eq!(stats.rule(11).unwrap().invalid_count, 2);
        assert_eq!(stats.facet_count(FACET_RECORD_IS_VALID, "false"), 2);
    }

    #[test]
    fn test_pushdown_matches_scan() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();

        let filters: [&[&str]; 5] = [
            &[],
            &["is_valid:false"],
            &["identifier:repo", "invalid_rules:11"],
            &["valid_rules:10", "is_transformed:false"],
            &["identifier:nothing"],
        ];
        for terms in filters {
            let filter = RecordFilter::parse(terms).unwrap();
            let pushed = aggregate_stats(&conn, &[10, 11], &filter).unwrap();
            let cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 2);
            let scanned = aggregate_by_scan(cursor, &[10, 11], &filter).unwrap();
            assert_eq!(pushed, scanned, "filter {:?}", terms);
        }
    }

    #[test]
    fn test_no_match_keeps_configured_rules() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();

        let filter = RecordFilter::parse(&["identifier:missing"]).unwrap();
        let stats = aggregate_stats(&conn, &[10, 11], &filter).unwrap();
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.rule_stats.len(), 2);
        assert!(stats.facets.is_empty());
    }

    #[test]
    fn test_query_page_orders_by_identifier() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();

        let first = query_page(&conn, 7, &RecordFilter::none(), 0, 2).unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.total_pages(), 2);
        let ids: Vec<_> = first.items.iter().map(|o| o.identifier.as_str()).collect();
        assert_eq!(ids, vec!["oai:other:c", "oai:repo:a"]);

        let second = query_page(&conn, 7, &RecordFilter::none(), 1, 2).unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].invalid_rules_ids, vec![11]);
        assert_eq!(second.items[0].snapshot_id, 7);

        let filtered = query_page(&conn, 7, &RecordFilter::parse(&["is_valid:false"]).unwrap(), 0, 10).unwrap();
        assert_eq!(filtered.total, 2);
    }

    #[test]
    fn test_page_past_the_end_is_empty() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();
        let filter = RecordFilter::parse(&["identifier:repo"]).unwrap();

        let past = query_page(&conn, 7, &filter, 5, 2).unwrap();
        assert!(past.items.is_empty());
        assert_eq!(past.total, 2);

        let far = query_page(&conn, 7, &filter, usize::MAX / 4, 10).unwrap();
        assert!(far.items.is_empty());
        assert_eq!(far.total, 2);
    }

    #[test]
    fn test_empty_hash_counts_in_both_paths() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();
        insert(&conn, "", "oai:repo:blank", false, false, &[(10, false), (11, true)]);

        let filter = RecordFilter::parse(&["identifier:oai"]).unwrap();
        let pushed = aggregate_stats(&conn, &[10, 11], &filter).unwrap();
        let cursor = RecordCursor::new(1, Connection::open(&db_path).unwrap(), 2);
        let scanned = aggregate_by_scan(cursor, &[10, 11], &filter).unwrap();
        assert_eq!(pushed.total_records, 4);
        assert_eq!(pushed, scanned);
    }

    #[test]
    fn test_page_by_hash_skips_rule_results() {
        let (_dir, db_path) = seeded();
        let conn = Connection::open(&db_path).unwrap();

        let page = page_by_hash(&conn, 1, 5).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].identifier_hash, "hb");
        assert!(page[0].rule_results.is_empty());
    }
}
