//! Page-at-a-time access to a snapshot's records for batch consumers

use super::lifecycle::SnapshotRegistry;
use super::query;
use super::schema;
use super::types::{SnapshotId, ValidationRecord};
use crate::error::{Result, StatsError, StorageContext};

/// Walks a snapshot in `identifier_hash` order, basic fields only
///
/// Pages are numbered from 1. The page size can be changed only before the
/// first page is read.
pub struct ValidationRecordPaginator<'a> {
    registry: &'a SnapshotRegistry,
    snapshot_id: SnapshotId,
    page_size: usize,
    next_page: u64,
    total_records: Option<u64>,
}

impl<'a> ValidationRecordPaginator<'a> {
    pub fn new(registry: &'a SnapshotRegistry, snapshot_id: SnapshotId, page_size: usize) -> Self {
        Self {
            registry,
            snapshot_id,
            page_size: page_size.max(1),
            next_page: 1,
            total_records: None,
        }
    }

    pub fn starting_page(&self) -> u64 {
        1
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if self.total_records.is_some() {
            return Err(StatsError::InvalidState {
                snapshot_id: self.snapshot_id,
                detail: "page size is fixed once paging has started".to_string(),
            });
        }
        self.page_size = page_size.max(1);
        Ok(())
    }

    fn total(&mut self) -> Result<u64> {
        if let Some(total) = self.total_records {
            return Ok(total);
        }
        let total = self.registry.with_store(self.snapshot_id, |store| {
            schema::count_records(&store.conn).storage_context(|| "counting records".to_string())
        })?;
        self.total_records = Some(total);
        Ok(total)
    }

    pub fn total_pages(&mut self) -> Result<u64> {
        Ok(self.total()?.div_ceil(self.page_size as u64))
    }

    /// Records of the given 1-based page; empty past the last page
    pub fn page(&mut self, page: u64) -> Result<Vec<ValidationRecord>> {
        self.total()?;
        let offset = page.saturating_sub(1).saturating_mul(self.page_size as u64);
        let limit = self.page_size;
        self.registry
            .with_store(self.snapshot_id, |store| query::page_by_hash(&store.conn, offset, limit))
    }

    /// Next page in sequence, `None` once every page was returned
    pub fn next_page(&mut self) -> Result<Option<Vec<ValidationRecord>>> {
        if self.next_page > self.total_pages()? {
            return Ok(None);
        }
        let records = self.page(self.next_page)?;
        self.next_page += 1;
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::paths::StaticNetworkResolver;
    use crate::validation_core::records;
    use std::sync::Arc;

    #[test]
    fn test_pages_cover_snapshot_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SnapshotRegistry::new(StatsConfig::new(dir.path()), Arc::new(StaticNetworkResolver::new()));
        registry.initialize_snapshot(1, &[], false).unwrap();

        let batch: Vec<_> = (0..7)
            .map(|i| ValidationRecord::new(format!("h{}", i), format!("oai:x:{}", i), i % 2 == 0))
            .collect();
        registry
            .with_writer(1, |store| records::insert_batch(store, &batch, 100))
            .unwrap();

        let mut paginator = ValidationRecordPaginator::new(&registry, 1, 10);
        paginator.set_page_size(3).unwrap();
        assert_eq!(paginator.total_pages().unwrap(), 3);
        assert!(paginator.set_page_size(5).is_err());

        let mut seen = Vec::new();
        while let Some(page) = paginator.next_page().unwrap() {
            seen.extend(page.into_iter().map(|r| r.identifier_hash));
        }
        assert_eq!(seen, vec!["h0", "h1", "h2", "h3", "h4", "h5", "h6"]);
        assert!(paginator.page(9).unwrap().is_empty());
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SnapshotRegistry::new(StatsConfig::new(dir.path()), Arc::new(StaticNetworkResolver::new()));

        let mut paginator = ValidationRecordPaginator::new(&registry, 42, 10);
        assert!(paginator.total_pages().unwrap_err().is_not_initialized());
    }
}
