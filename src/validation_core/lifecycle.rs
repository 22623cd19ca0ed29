//! Per-snapshot storage handles
//!
//! One slot per snapshot id, each behind its own mutex. The shared map is only
//! touched long enough to fetch a slot, so I/O on snapshot A never waits on B.

use super::schema;
use super::stats::SnapshotValidationStats;
use super::types::{RuleId, RuleOccurrence, SnapshotId, SnapshotState, ValidationRecord};
use crate::config::StatsConfig;
use crate::error::{Result, StatsError, StorageContext};
use crate::paths::{NetworkResolver, SnapshotPaths};
use crate::sqlite_pragma::{apply_optimized_pragmas, apply_read_only_pragmas};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Counters and not-yet-committed rows of a snapshot being validated
#[derive(Debug, Default)]
pub struct WriteState {
    pub stats: SnapshotValidationStats,
    pub pending_records: Vec<ValidationRecord>,
    pub pending_occurrences: Vec<RuleOccurrence>,
}

impl WriteState {
    fn new(rule_ids: &[RuleId]) -> Self {
        Self {
            stats: SnapshotValidationStats::with_rules(rule_ids),
            ..Self::default()
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_records.is_empty() || !self.pending_occurrences.is_empty()
    }
}

pub enum StoreMode {
    Writing(WriteState),
    ReadOnly,
}

/// An open snapshot store
pub struct OpenStore {
    pub snapshot_id: SnapshotId,
    pub paths: SnapshotPaths,
    pub conn: Connection,
    /// Rule ids in registration order
    pub rule_ids: Vec<RuleId>,
    /// Occurrence ledger present
    pub detailed: bool,
    pub mode: StoreMode,
}

impl OpenStore {
    pub fn rule_set(&self) -> BTreeSet<RuleId> {
        self.rule_ids.iter().copied().collect()
    }

    pub fn state(&self) -> SnapshotState {
        match &self.mode {
            StoreMode::Writing(ws) if ws.stats.total_records == 0 && !ws.has_pending() => {
                SnapshotState::Initializing
            }
            StoreMode::Writing(_) => SnapshotState::Writing,
            StoreMode::ReadOnly => SnapshotState::Finalized,
        }
    }

    pub fn write_state(&self) -> Option<&WriteState> {
        match &self.mode {
            StoreMode::Writing(ws) => Some(ws),
            StoreMode::ReadOnly => None,
        }
    }

    pub fn write_state_mut(&mut self) -> Result<&mut WriteState> {
        match &mut self.mode {
            StoreMode::Writing(ws) => Ok(ws),
            StoreMode::ReadOnly => Err(StatsError::InvalidState {
                snapshot_id: self.snapshot_id,
                detail: "store is open read-only".to_string(),
            }),
        }
    }

    fn close(self) -> Result<()> {
        let snapshot_id = self.snapshot_id;
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .storage_context(|| format!("closing database of snapshot {}", snapshot_id))
    }
}

#[derive(Default)]
pub struct SnapshotSlot {
    store: Option<OpenStore>,
}

/// Registry of open snapshot stores
///
/// Constructed once and shared by reference; `shutdown` closes every handle.
pub struct SnapshotRegistry {
    config: StatsConfig,
    resolver: Arc<dyn NetworkResolver>,
    slots: DashMap<SnapshotId, Arc<Mutex<SnapshotSlot>>>,
}

impl SnapshotRegistry {
    pub fn new(config: StatsConfig, resolver: Arc<dyn NetworkResolver>) -> Self {
        Self {
            config,
            resolver,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn paths(&self, snapshot_id: SnapshotId) -> SnapshotPaths {
        let acronym = self.resolver.network_acronym(snapshot_id);
        SnapshotPaths::resolve(&self.config.base_path, acronym.as_deref(), snapshot_id)
    }

    fn slot(&self, snapshot_id: SnapshotId) -> Arc<Mutex<SnapshotSlot>> {
        Arc::clone(&self.slots.entry(snapshot_id).or_default())
    }

    fn existing_slot(&self, snapshot_id: SnapshotId) -> Option<Arc<Mutex<SnapshotSlot>>> {
        self.slots.get(&snapshot_id).map(|slot| Arc::clone(slot.value()))
    }

    /// Drop the slot when it holds no store and no caller still references it
    ///
    /// Slot handles are only cloned under the map's shard lock, so a strong
    /// count of one inside `remove_if` means nobody can be waiting on it.
    fn prune_slot(&self, snapshot_id: SnapshotId) {
        self.slots.remove_if(&snapshot_id, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_some_and(|guard| guard.store.is_none())
        });
    }

    /// Close idle read-only handles of other snapshots beyond `max_open_readers`
    fn release_idle_readers(&self, keep: SnapshotId) {
        let others: Vec<(SnapshotId, Arc<Mutex<SnapshotSlot>>)> = self
            .slots
            .iter()
            .filter(|entry| *entry.key() != keep)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let readers: Vec<(SnapshotId, Arc<Mutex<SnapshotSlot>>)> = others
            .into_iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .is_some_and(|guard| guard.store.as_ref().is_some_and(|s| s.write_state().is_none()))
            })
            .collect();

        // Leave room for the handle about to be opened
        let excess = (readers.len() + 1).saturating_sub(self.config.max_open_readers.max(1));
        let mut released = Vec::new();
        for (snapshot_id, slot) in readers.into_iter().take(excess) {
            let Some(mut guard) = slot.try_lock() else {
                continue;
            };
            if !guard.store.as_ref().is_some_and(|s| s.write_state().is_none()) {
                continue;
            }
            if let Some(store) = guard.store.take() {
                match store.close() {
                    Ok(()) => log::debug!("VALIDATION DB: Released idle reader of snapshot {}", snapshot_id),
                    Err(e) => log::warn!("VALIDATION DB: Failed to release reader of snapshot {}: {}", snapshot_id, e),
                }
            }
            released.push(snapshot_id);
        }
        for snapshot_id in released {
            self.prune_slot(snapshot_id);
        }
    }

    /// Number of slots currently tracked
    pub fn tracked_slots(&self) -> usize {
        self.slots.len()
    }

    /// Wipe any previous storage and create a fresh writable store
    pub fn initialize_snapshot(&self, snapshot_id: SnapshotId, rule_ids: &[RuleId], detailed: bool) -> Result<()> {
        let rule_ids = dedup_rule_ids(rule_ids);
        let paths = self.paths(snapshot_id);
        log::info!("VALIDATION DB: Initializing database for snapshot {}", snapshot_id);

        let slot = self.slot(snapshot_id);
        let mut guard = slot.lock();

        if let Some(previous) = guard.store.take() {
            log::info!("VALIDATION DB: Closing previous handle for snapshot {}", snapshot_id);
            previous.close()?;
        }
        if paths.has_database() || paths.has_stats() {
            log::info!("VALIDATION DB: Deleting existing database for snapshot {}", snapshot_id);
        }
        remove_artifacts(&paths)?;

        fs::create_dir_all(&paths.validation_dir)
            .storage_context(|| format!("creating {}", paths.validation_dir.display()))?;

        let mut conn = Connection::open(&paths.db_path)
            .storage_context(|| format!("opening {}", paths.db_path.display()))?;
        apply_optimized_pragmas(&conn).storage_context(|| "applying pragmas".to_string())?;
        schema::create_tables(&conn, detailed).storage_context(|| "creating validation tables".to_string())?;
        schema::store_rule_ids(&mut conn, &rule_ids).storage_context(|| "registering rule ids".to_string())?;

        log::info!(
            "VALIDATION DB: Initialized database for snapshot {} with {} rules (WAL mode, detailed={})",
            snapshot_id,
            rule_ids.len(),
            detailed
        );

        guard.store = Some(OpenStore {
            snapshot_id,
            mode: StoreMode::Writing(WriteState::new(&rule_ids)),
            paths,
            conn,
            rule_ids,
            detailed,
        });
        Ok(())
    }

    /// Open an existing store read-only; no-op when a handle is already live
    pub fn open_for_read(&self, snapshot_id: SnapshotId) -> Result<()> {
        self.with_store(snapshot_id, |_| Ok(()))
    }

    fn open_read_store(&self, snapshot_id: SnapshotId) -> Result<OpenStore> {
        let paths = self.paths(snapshot_id);
        if !paths.has_database() {
            return Err(StatsError::NotInitialized { snapshot_id });
        }

        let conn = open_reader_connection(&paths.db_path)?;
        let rule_ids = schema::load_rule_ids(&conn).storage_context(|| "loading rule ids".to_string())?;
        let detailed =
            schema::has_occurrence_table(&conn).storage_context(|| "inspecting schema".to_string())?;

        log::debug!(
            "VALIDATION DB: Opened database for reading - snapshot {} ({} rules)",
            snapshot_id,
            rule_ids.len()
        );

        Ok(OpenStore {
            snapshot_id,
            paths,
            conn,
            rule_ids,
            detailed,
            mode: StoreMode::ReadOnly,
        })
    }

    /// Run `f` against the snapshot's store, opening it read-only if needed
    pub fn with_store<R>(&self, snapshot_id: SnapshotId, f: impl FnOnce(&mut OpenStore) -> Result<R>) -> Result<R> {
        let slot = match self.existing_slot(snapshot_id) {
            Some(slot) => slot,
            None if self.paths(snapshot_id).has_database() => self.slot(snapshot_id),
            None => return Err(StatsError::NotInitialized { snapshot_id }),
        };

        let mut guard = slot.lock();
        let store = match guard.store.take() {
            Some(store) => store,
            None => {
                self.release_idle_readers(snapshot_id);
                match self.open_read_store(snapshot_id) {
                    Ok(store) => store,
                    Err(e) => {
                        drop(guard);
                        drop(slot);
                        self.prune_slot(snapshot_id);
                        return Err(e);
                    }
                }
            }
        };
        let store = guard.store.insert(store);
        f(store)
    }

    /// Run `f` against a store that is accepting writes
    pub fn with_writer<R>(&self, snapshot_id: SnapshotId, f: impl FnOnce(&mut OpenStore) -> Result<R>) -> Result<R> {
        let Some(slot) = self.existing_slot(snapshot_id) else {
            return Err(self.not_writable(snapshot_id));
        };

        let mut guard = slot.lock();
        match guard.store.as_mut() {
            Some(store) if store.write_state().is_some() => f(store),
            _ => Err(self.not_writable(snapshot_id)),
        }
    }

    fn not_writable(&self, snapshot_id: SnapshotId) -> StatsError {
        if self.paths(snapshot_id).has_database() {
            StatsError::InvalidState {
                snapshot_id,
                detail: "snapshot is finalized; re-initialize it to write".to_string(),
            }
        } else {
            StatsError::NotInitialized { snapshot_id }
        }
    }

    /// Persist the stats summary, checkpoint and close the writer
    ///
    /// `before_close` runs under the snapshot lock so pending rows can be
    /// flushed first.
    pub fn finalize_snapshot(
        &self,
        snapshot_id: SnapshotId,
        before_close: impl FnOnce(&mut OpenStore) -> Result<()>,
    ) -> Result<SnapshotValidationStats> {
        let Some(slot) = self.existing_slot(snapshot_id) else {
            return Err(self.not_writable(snapshot_id));
        };
        let mut guard = slot.lock();

        let stats = match guard.store.as_mut() {
            Some(store) if store.write_state().is_some() => {
                before_close(store)?;
                store
                    .conn
                    .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                    .storage_context(|| "checkpointing WAL".to_string())?;
                let stats = store.write_state_mut()?.stats.snapshot();
                stats.persist(&store.paths.stats_path)?;
                stats
            }
            _ => return Err(self.not_writable(snapshot_id)),
        };

        if let Some(store) = guard.store.take() {
            store.close()?;
        }
        drop(guard);
        drop(slot);
        self.prune_slot(snapshot_id);

        log::info!(
            "VALIDATION DB: Finalized snapshot {} - {} total records",
            snapshot_id,
            stats.total_records
        );
        Ok(stats)
    }

    /// Release the handle without touching files
    pub fn close(&self, snapshot_id: SnapshotId) -> Result<bool> {
        let Some(slot) = self.existing_slot(snapshot_id) else {
            return Ok(false);
        };
        let store = slot.lock().store.take();
        drop(slot);
        let closed = match store {
            Some(store) => {
                if store.write_state().is_some_and(WriteState::has_pending) {
                    log::warn!("VALIDATION DB: Closing snapshot {} with unflushed rows", snapshot_id);
                }
                store.close()?;
                log::debug!("VALIDATION DB: Closed handle for snapshot {}", snapshot_id);
                true
            }
            None => false,
        };
        self.prune_slot(snapshot_id);
        Ok(closed)
    }

    /// Close the handle and remove database and stats artifacts from disk
    pub fn delete_snapshot(&self, snapshot_id: SnapshotId) -> Result<()> {
        let paths = self.paths(snapshot_id);
        let slot = self.slot(snapshot_id);
        {
            let mut guard = slot.lock();
            if let Some(store) = guard.store.take() {
                store.close()?;
            }
            remove_artifacts(&paths)?;
            // Only succeeds when nothing else lives in the directory
            let _ = fs::remove_dir(&paths.validation_dir);
        }
        drop(slot);
        self.prune_slot(snapshot_id);

        log::info!("VALIDATION DB: Deleted validation data for snapshot {}", snapshot_id);
        Ok(())
    }

    /// Clone a finalized snapshot's database and stats into `to_id`
    pub fn copy_snapshot(&self, from_id: SnapshotId, to_id: SnapshotId) -> Result<SnapshotValidationStats> {
        if from_id == to_id {
            return Err(StatsError::InvalidState {
                snapshot_id: from_id,
                detail: "cannot copy a snapshot onto itself".to_string(),
            });
        }

        let copied = self.copy_between(from_id, to_id);
        self.prune_slot(from_id);
        self.prune_slot(to_id);
        copied
    }

    fn copy_between(&self, from_id: SnapshotId, to_id: SnapshotId) -> Result<SnapshotValidationStats> {
        // Lock in id order so concurrent copies in opposite directions cannot deadlock
        let low = self.slot(from_id.min(to_id));
        let high = self.slot(from_id.max(to_id));
        let mut low_guard = low.lock();
        let mut high_guard = high.lock();
        let (from_slot, to_slot) = if from_id < to_id {
            (&mut *low_guard, &mut *high_guard)
        } else {
            (&mut *high_guard, &mut *low_guard)
        };

        if from_slot.store.as_ref().is_some_and(|s| s.write_state().is_some()) {
            return Err(StatsError::InvalidState {
                snapshot_id: from_id,
                detail: "source snapshot is still being written".to_string(),
            });
        }

        let from_paths = self.paths(from_id);
        if !from_paths.has_database() {
            return Err(StatsError::NotInitialized { snapshot_id: from_id });
        }
        if !from_paths.has_stats() {
            return Err(StatsError::InvalidState {
                snapshot_id: from_id,
                detail: "source snapshot was never finalized".to_string(),
            });
        }

        let to_paths = self.paths(to_id);
        if let Some(store) = to_slot.store.take() {
            store.close()?;
        }
        remove_artifacts(&to_paths)?;
        fs::create_dir_all(&to_paths.validation_dir)
            .storage_context(|| format!("creating {}", to_paths.validation_dir.display()))?;

        let source = Connection::open(&from_paths.db_path)
            .storage_context(|| format!("opening {}", from_paths.db_path.display()))?;
        source
            .execute("VACUUM INTO ?1", [to_paths.db_path.to_string_lossy()])
            .storage_context(|| format!("copying database to {}", to_paths.db_path.display()))?;
        source
            .close()
            .map_err(|(_, e)| e)
            .storage_context(|| "closing copy source".to_string())?;

        fs::copy(&from_paths.stats_path, &to_paths.stats_path)
            .storage_context(|| format!("copying stats to {}", to_paths.stats_path.display()))?;
        let stats = SnapshotValidationStats::load(&to_paths.stats_path)?;

        log::info!(
            "VALIDATION DB: Copied snapshot {} to {} ({} records)",
            from_id,
            to_id,
            stats.total_records
        );
        Ok(stats)
    }

    pub fn snapshot_state(&self, snapshot_id: SnapshotId) -> SnapshotState {
        if let Some(slot) = self.existing_slot(snapshot_id) {
            if let Some(store) = slot.lock().store.as_ref() {
                return store.state();
            }
        }
        if self.paths(snapshot_id).has_database() {
            SnapshotState::Finalized
        } else {
            SnapshotState::Uninitialized
        }
    }

    /// Counters of a snapshot that is currently being written
    pub fn live_stats(&self, snapshot_id: SnapshotId) -> Option<SnapshotValidationStats> {
        let slot = self.existing_slot(snapshot_id)?;
        let guard = slot.lock();
        guard
            .store
            .as_ref()
            .and_then(OpenStore::write_state)
            .map(|ws| ws.stats.snapshot())
    }

    pub fn is_open(&self, snapshot_id: SnapshotId) -> bool {
        self.existing_slot(snapshot_id)
            .is_some_and(|slot| slot.lock().store.is_some())
    }

    /// Fresh read-only connection, independent of the registry handle
    pub fn reader_connection(&self, snapshot_id: SnapshotId) -> Result<(Connection, Vec<RuleId>)> {
        let paths = self.paths(snapshot_id);
        if !paths.has_database() {
            return Err(StatsError::NotInitialized { snapshot_id });
        }
        let conn = open_reader_connection(&paths.db_path)?;
        let rule_ids = schema::load_rule_ids(&conn).storage_context(|| "loading rule ids".to_string())?;
        Ok((conn, rule_ids))
    }

    /// Close every open handle; returns how many were closed
    pub fn shutdown(&self) -> Result<usize> {
        let slots: Vec<(SnapshotId, Arc<Mutex<SnapshotSlot>>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        log::info!("VALIDATION DB: Shutting down, {} snapshot slots", slots.len());

        let mut closed = 0;
        let mut first_error = None;
        for (snapshot_id, slot) in slots {
            let Some(store) = slot.lock().store.take() else {
                continue;
            };
            if store.write_state().is_some_and(WriteState::has_pending) {
                log::warn!(
                    "VALIDATION DB: Discarding unflushed rows of snapshot {} at shutdown",
                    snapshot_id
                );
            }
            match store.close() {
                Ok(()) => closed += 1,
                Err(e) => {
                    log::warn!("VALIDATION DB: Failed to close snapshot {}: {}", snapshot_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.slots.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

fn open_reader_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path).storage_context(|| format!("opening {}", db_path.display()))?;
    apply_read_only_pragmas(&conn).storage_context(|| "applying read-only pragmas".to_string())?;
    Ok(conn)
}

fn remove_artifacts(paths: &SnapshotPaths) -> Result<()> {
    let tmp_stats = paths.stats_path.with_extension("json.tmp");
    for path in paths.db_artifacts().iter().chain([&paths.stats_path, &tmp_stats]) {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("VALIDATION DB: Removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StatsError::storage(format!("removing {}", path.display()), e)),
        }
    }
    Ok(())
}

fn dedup_rule_ids(rule_ids: &[RuleId]) -> Vec<RuleId> {
    let mut seen = BTreeSet::new();
    rule_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
