//! Validation statistics service
//!
//! Facade used by the validation worker (initialize, add/insert, finalize)
//! and by reporting code (aggregate, listing, drill-down queries). Every call
//! runs synchronously on the caller's thread.

use crate::config::StatsConfig;
use crate::error::Result;
use crate::paths::NetworkResolver;
use crate::validation_core::filter::RecordFilter;
use crate::validation_core::lifecycle::OpenStore;
use crate::validation_core::{occurrences, query, records};
use crate::validation_core::{
    OccurrenceCount, Page, RecordCursor, RecordOutcome, RecordValidation, RuleFact, RuleId, RuleOccurrence,
    RuleOccurrenceCounts, SnapshotId, SnapshotRegistry, SnapshotState, SnapshotValidationStats,
    ValidationObservation, ValidationRecord, ValidationRecordPaginator,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ValidationStatsService {
    registry: SnapshotRegistry,
    detailed_diagnose: AtomicBool,
}

impl ValidationStatsService {
    pub fn new(config: StatsConfig, resolver: Arc<dyn NetworkResolver>) -> Self {
        let detailed = config.detailed_diagnose;
        log::info!(
            "VALIDATION DB: Statistics store at {} (batch size {}, detailed={})",
            config.base_path.display(),
            config.batch_size,
            detailed
        );
        Self {
            registry: SnapshotRegistry::new(config, resolver),
            detailed_diagnose: AtomicBool::new(detailed),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        self.registry.config()
    }

    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    /// Collect occurrence values for snapshots initialized from now on
    pub fn set_detailed_diagnose(&self, enabled: bool) {
        self.detailed_diagnose.store(enabled, Ordering::Relaxed);
    }

    pub fn is_detailed_diagnose(&self) -> bool {
        self.detailed_diagnose.load(Ordering::Relaxed)
    }

    /// Wipe any earlier validation of the snapshot and start a new one
    pub fn initialize_validation_for_snapshot(&self, snapshot_id: SnapshotId, rule_ids: &[RuleId]) -> Result<()> {
        let result = self
            .registry
            .initialize_snapshot(snapshot_id, rule_ids, self.is_detailed_diagnose());
        logged("initialize", snapshot_id, result)
    }

    pub fn register_rule_ids(&self, snapshot_id: SnapshotId, rule_ids: &[RuleId]) -> Result<()> {
        self.registry
            .with_writer(snapshot_id, |store| records::register_rule_ids(store, rule_ids))
    }

    /// Buffer one outcome; the buffer is committed once it reaches the batch size
    ///
    /// An outcome whose rule set does not match is rejected on its own without
    /// touching the buffer. A failed flush discards the buffered batch.
    pub fn add_observation(&self, snapshot_id: SnapshotId, outcome: &RecordOutcome) -> Result<()> {
        let batch_size = self.config().batch_size;
        let detailed = self.is_detailed_diagnose();

        let result = self.registry.with_writer(snapshot_id, |store| {
            let record = outcome.to_record();
            records::check_rule_sets(store, std::slice::from_ref(&record))?;

            let ws = store.write_state_mut()?;
            ws.pending_records.push(record);
            if detailed {
                ws.pending_occurrences.extend(outcome.rule_occurrences());
            }
            if ws.pending_records.len() >= batch_size {
                flush_pending(store, batch_size)?;
            }
            Ok(())
        });
        logged("add observation", snapshot_id, result)
    }

    /// Commit buffered outcomes without finalizing
    pub fn flush(&self, snapshot_id: SnapshotId) -> Result<()> {
        let batch_size = self.config().batch_size;
        self.registry
            .with_writer(snapshot_id, |store| flush_pending(store, batch_size))
    }

    /// Write a batch in one transaction; nothing is kept on failure
    pub fn insert_batch(&self, snapshot_id: SnapshotId, batch: &[ValidationRecord]) -> Result<()> {
        let batch_size = self.config().batch_size;
        let result = self
            .registry
            .with_writer(snapshot_id, |store| records::insert_batch(store, batch, batch_size));
        logged("insert batch", snapshot_id, result)
    }

    pub fn insert(&self, snapshot_id: SnapshotId, record: &ValidationRecord) -> Result<()> {
        self.registry
            .with_writer(snapshot_id, |store| records::insert(store, record))
    }

    pub fn insert_occurrences(&self, snapshot_id: SnapshotId, rows: &[RuleOccurrence]) -> Result<()> {
        let batch_size = self.config().batch_size;
        let result = self
            .registry
            .with_writer(snapshot_id, |store| records::write_batch(store, &[], rows, batch_size));
        logged("insert occurrences", snapshot_id, result)
    }

    /// Flush, persist the stats summary and close the snapshot
    pub fn finalize_validation_for_snapshot(&self, snapshot_id: SnapshotId) -> Result<SnapshotValidationStats> {
        let batch_size = self.config().batch_size;
        let result = self
            .registry
            .finalize_snapshot(snapshot_id, |store| flush_pending(store, batch_size));
        logged("finalize", snapshot_id, result)
    }

    pub fn close_snapshot(&self, snapshot_id: SnapshotId) -> Result<bool> {
        self.registry.close(snapshot_id)
    }

    pub fn delete_validation_stats_by_snapshot_id(&self, snapshot_id: SnapshotId) -> Result<()> {
        logged("delete", snapshot_id, self.registry.delete_snapshot(snapshot_id))
    }

    /// Clone a finalized snapshot's results under another snapshot id
    pub fn copy_validation_stats_observations_from_to(
        &self,
        from_id: SnapshotId,
        to_id: SnapshotId,
    ) -> Result<SnapshotValidationStats> {
        logged("copy", from_id, self.registry.copy_snapshot(from_id, to_id))
    }

    /// Aggregate statistics, optionally restricted by filter terms
    ///
    /// Without filters this is served from the live counters or the persisted
    /// summary, never from a scan of the records.
    pub fn query_aggregated_stats<S: AsRef<str>>(
        &self,
        snapshot_id: SnapshotId,
        filters: &[S],
    ) -> Result<SnapshotValidationStats> {
        let filter = RecordFilter::parse(filters)?;
        if !filter.is_empty() {
            return self.registry.with_store(snapshot_id, |store| {
                query::aggregate_stats(&store.conn, &store.rule_ids, &filter)
            });
        }

        if let Some(stats) = self.registry.live_stats(snapshot_id) {
            return Ok(stats);
        }

        let paths = self.registry.paths(snapshot_id);
        if paths.has_stats() {
            return SnapshotValidationStats::load(&paths.stats_path);
        }

        // No summary on disk (interrupted run): recompute from the rows
        self.registry.with_store(snapshot_id, |store| {
            log::warn!(
                "STATS: No persisted summary for snapshot {}, recomputing from records",
                snapshot_id
            );
            query::aggregate_stats(&store.conn, &store.rule_ids, &filter)
        })
    }

    /// Filtered aggregate computed by streaming every record through the filter
    pub fn aggregate_by_scan<S: AsRef<str>>(&self, snapshot_id: SnapshotId, filters: &[S]) -> Result<SnapshotValidationStats> {
        let filter = RecordFilter::parse(filters)?;
        let (conn, rule_ids) = self.registry.reader_connection(snapshot_id)?;
        let cursor = RecordCursor::new(snapshot_id, conn, self.config().cursor_page_size);
        query::aggregate_by_scan(cursor, &rule_ids, &filter)
    }

    /// Zero-based page of observations ordered by identifier
    pub fn query_paginated<S: AsRef<str>>(
        &self,
        snapshot_id: SnapshotId,
        filters: &[S],
        page: usize,
        size: usize,
    ) -> Result<Page<ValidationObservation>> {
        let filter = RecordFilter::parse(filters)?;
        self.registry
            .with_store(snapshot_id, |store| query::query_page(&store.conn, snapshot_id, &filter, page, size))
    }

    /// Occurrence value counts for one rule among the records matching `filters`
    pub fn query_rule_occurrences<S: AsRef<str>>(
        &self,
        snapshot_id: SnapshotId,
        rule_id: RuleId,
        filters: &[S],
    ) -> Result<RuleOccurrenceCounts> {
        let filter = RecordFilter::parse(filters)?;
        self.registry.with_store(snapshot_id, |store| {
            occurrences::rule_occurrence_counts(&store.conn, rule_id, &filter)
        })
    }

    pub fn count_by_rule_and_validity(
        &self,
        snapshot_id: SnapshotId,
        rule_id: RuleId,
        is_valid: bool,
    ) -> Result<Vec<OccurrenceCount>> {
        self.registry.with_store(snapshot_id, |store| {
            occurrences::count_by_rule_and_validity(&store.conn, rule_id, is_valid, &RecordFilter::none())
        })
    }

    pub fn get_occurrences_by_record(&self, snapshot_id: SnapshotId, identifier_hash: &str) -> Result<Vec<RuleOccurrence>> {
        self.registry.with_store(snapshot_id, |store| {
            occurrences::occurrences_by_record(&store.conn, identifier_hash)
        })
    }

    /// Per-record diagnostic view with occurrence values when they were stored
    pub fn get_record_validation(&self, snapshot_id: SnapshotId, identifier: &str) -> Result<Option<RecordValidation>> {
        self.registry.with_store(snapshot_id, |store| record_validation(store, identifier))
    }

    pub fn query_by_rule(
        &self,
        snapshot_id: SnapshotId,
        rule_id: RuleId,
        is_valid: bool,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ValidationRecord>> {
        self.registry.with_store(snapshot_id, |store| {
            records::query_by_rule(&store.conn, rule_id, is_valid, offset, limit)
        })
    }

    /// Lazy, forward-only pass over every record of the snapshot
    ///
    /// The cursor holds its own connection until it is exhausted, closed or dropped.
    pub fn stream_all(&self, snapshot_id: SnapshotId) -> Result<RecordCursor> {
        let (conn, _) = self.registry.reader_connection(snapshot_id)?;
        Ok(RecordCursor::new(snapshot_id, conn, self.config().cursor_page_size))
    }

    pub fn paginator(&self, snapshot_id: SnapshotId) -> ValidationRecordPaginator<'_> {
        ValidationRecordPaginator::new(&self.registry, snapshot_id, self.config().cursor_page_size)
    }

    pub fn validate_filters<S: AsRef<str>>(&self, filters: &[S]) -> bool {
        RecordFilter::parse(filters).is_ok()
    }

    pub fn snapshot_state(&self, snapshot_id: SnapshotId) -> SnapshotState {
        self.registry.snapshot_state(snapshot_id)
    }

    /// Close every open handle; unflushed buffers are dropped
    pub fn shutdown(&self) -> Result<usize> {
        self.registry.shutdown()
    }
}

fn flush_pending(store: &mut OpenStore, batch_size: usize) -> Result<()> {
    let ws = store.write_state_mut()?;
    if !ws.has_pending() {
        return Ok(());
    }
    let pending_records = std::mem::take(&mut ws.pending_records);
    let pending_occurrences = std::mem::take(&mut ws.pending_occurrences);
    records::write_batch(store, &pending_records, &pending_occurrences, batch_size)
}

fn record_validation(store: &OpenStore, identifier: &str) -> Result<Option<RecordValidation>> {
    let Some(record) = records::get_by_identifier(&store.conn, identifier)? else {
        return Ok(None);
    };
    let occurrence_rows = occurrences::occurrences_by_record(&store.conn, &record.identifier_hash)?;

    let rule_facts = record
        .rule_results
        .iter()
        .map(|(rule_id, is_valid)| {
            let mut fact = RuleFact {
                rule_id: *rule_id,
                is_valid: *is_valid,
                valid_occurrences: Vec::new(),
                invalid_occurrences: Vec::new(),
            };
            for row in occurrence_rows.iter().filter(|row| row.rule_id == *rule_id) {
                let Some(value) = row.occurrence_value.clone() else {
                    continue;
                };
                if row.is_valid {
                    fact.valid_occurrences.push(value);
                } else {
                    fact.invalid_occurrences.push(value);
                }
            }
            fact
        })
        .collect();

    Ok(Some(RecordValidation {
        identifier: record.identifier,
        datestamp: record.datestamp,
        is_valid: record.is_valid,
        is_transformed: record.is_transformed,
        published_metadata_hash: record.published_metadata_hash,
        rule_facts,
    }))
}

fn logged<T>(operation: &str, snapshot_id: SnapshotId, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        log::error!("VALIDATION DB: {} failed for snapshot {}: {}", operation, snapshot_id, e);
    }
    result
}
