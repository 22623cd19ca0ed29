//! Filesystem layout for per-snapshot validation storage
//!
//! ```text
//! {base_path}/
//! └── {NETWORK}/                  sanitize_network_acronym()
//!     └── snapshots/
//!         └── snapshot_{id}/
//!             └── validation/
//!                 ├── validation.db
//!                 └── validation-stats.json
//! ```

use crate::validation_core::types::SnapshotId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const VALIDATION_SUBDIR: &str = "validation";
pub const DB_FILENAME: &str = "validation.db";
pub const STATS_FILENAME: &str = "validation-stats.json";

const UNKNOWN_NETWORK: &str = "UNKNOWN";

/// Uppercase the acronym and replace anything outside `[A-Z0-9-_]` with `_`
pub fn sanitize_network_acronym(acronym: Option<&str>) -> String {
    match acronym.map(str::trim) {
        None | Some("") => UNKNOWN_NETWORK.to_string(),
        Some(raw) => raw
            .to_uppercase()
            .chars()
            .map(|c| {
                if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    }
}

/// Maps a snapshot id to the acronym of the network that harvested it
pub trait NetworkResolver: Send + Sync {
    fn network_acronym(&self, snapshot_id: SnapshotId) -> Option<String>;
}

/// Fixed snapshot → network table, for single-network deployments and tests
#[derive(Debug, Default, Clone)]
pub struct StaticNetworkResolver {
    default_acronym: Option<String>,
    by_snapshot: HashMap<SnapshotId, String>,
}

impl StaticNetworkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot not registered explicitly resolves to `acronym`
    pub fn with_default(acronym: impl Into<String>) -> Self {
        Self {
            default_acronym: Some(acronym.into()),
            by_snapshot: HashMap::new(),
        }
    }

    pub fn register(&mut self, snapshot_id: SnapshotId, acronym: impl Into<String>) {
        self.by_snapshot.insert(snapshot_id, acronym.into());
    }
}

impl NetworkResolver for StaticNetworkResolver {
    fn network_acronym(&self, snapshot_id: SnapshotId) -> Option<String> {
        self.by_snapshot
            .get(&snapshot_id)
            .cloned()
            .or_else(|| self.default_acronym.clone())
    }
}

/// Resolved file locations for one snapshot's validation storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub validation_dir: PathBuf,
    pub db_path: PathBuf,
    pub stats_path: PathBuf,
}

impl SnapshotPaths {
    pub fn resolve(base_path: &Path, network_acronym: Option<&str>, snapshot_id: SnapshotId) -> Self {
        let validation_dir = base_path
            .join(sanitize_network_acronym(network_acronym))
            .join("snapshots")
            .join(format!("snapshot_{}", snapshot_id))
            .join(VALIDATION_SUBDIR);

        Self {
            db_path: validation_dir.join(DB_FILENAME),
            stats_path: validation_dir.join(STATS_FILENAME),
            validation_dir,
        }
    }

    /// Database file plus the WAL siblings SQLite leaves next to it
    pub fn db_artifacts(&self) -> [PathBuf; 3] {
        let mut wal = self.db_path.clone().into_os_string();
        wal.push("-wal");
        let mut shm = self.db_path.clone().into_os_string();
        shm.push("-shm");
        [self.db_path.clone(), PathBuf::from(wal), PathBuf::from(shm)]
    }

    pub fn has_database(&self) -> bool {
        self.db_path.exists()
    }

    pub fn has_stats(&self) -> bool {
        self.stats_path.exists()
    }
}
