//! In-memory snapshot statistics accumulator
//!
//! Counters are bumped once per written record and persisted as a small JSON
//! side file at finalize, so unfiltered aggregate reads never scan the database.

use super::types::{RuleId, ValidationRecord};
use crate::error::{Result, StorageContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const FACET_RECORD_IS_VALID: &str = "record_is_valid";
pub const FACET_RECORD_IS_TRANSFORMED: &str = "record_is_transformed";
pub const FACET_VALID_RULES: &str = "valid_rules";
pub const FACET_INVALID_RULES: &str = "invalid_rules";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub valid_count: u64,
    pub invalid_count: u64,
}

/// Accumulated counters tied 1:1 to a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotValidationStats {
    pub total_records: u64,
    pub valid_records: u64,
    pub transformed_records: u64,
    pub rule_stats: BTreeMap<RuleId, RuleStats>,
    /// facet name → value → record count
    pub facets: BTreeMap<String, BTreeMap<String, u64>>,
}

impl SnapshotValidationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty stats listing every configured rule with zero counts
    pub fn with_rules(rule_ids: &[RuleId]) -> Self {
        let mut stats = Self::new();
        for rule_id in rule_ids {
            stats.register_rule(*rule_id);
        }
        stats
    }

    pub fn register_rule(&mut self, rule_id: RuleId) {
        self.rule_stats.entry(rule_id).or_default();
    }

    pub fn invalid_records(&self) -> u64 {
        self.total_records.saturating_sub(self.valid_records)
    }

    pub fn rule(&self, rule_id: RuleId) -> Option<&RuleStats> {
        self.rule_stats.get(&rule_id)
    }

    pub fn facet(&self, name: &str) -> Option<&BTreeMap<String, u64>> {
        self.facets.get(name)
    }

    pub fn facet_count(&self, name: &str, value: &str) -> u64 {
        self.facets
            .get(name)
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }

    pub fn update_facet(&mut self, name: &str, value: &str) {
        self.add_facet_count(name, value, 1);
    }

    /// Add `count` to a facet value; zero counts leave no entry behind
    pub fn add_facet_count(&mut self, name: &str, value: &str, count: u64) {
        if count == 0 {
            return;
        }
        *self
            .facets
            .entry(name.to_string())
            .or_default()
            .entry(value.to_string())
            .or_insert(0) += count;
    }

    pub fn update_from_record(&mut self, record: &ValidationRecord) {
        self.total_records += 1;
        if record.is_valid {
            self.valid_records += 1;
        }
        if record.is_transformed {
            self.transformed_records += 1;
        }

        self.update_facet(FACET_RECORD_IS_VALID, bool_facet_value(record.is_valid));
        self.update_facet(FACET_RECORD_IS_TRANSFORMED, bool_facet_value(record.is_transformed));

        for (rule_id, valid) in &record.rule_results {
            let counters = self.rule_stats.entry(*rule_id).or_default();
            let rule_key = rule_id.to_string();
            if *valid {
                counters.valid_count += 1;
                self.update_facet(FACET_VALID_RULES, &rule_key);
            } else {
                counters.invalid_count += 1;
                self.update_facet(FACET_INVALID_RULES, &rule_key);
            }
        }
    }

    /// Immutable copy of the current counters
    pub fn snapshot(&self) -> SnapshotValidationStats {
        self.clone()
    }

    /// Write the summary next to the database via temp file + rename
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .storage_context(|| format!("creating stats directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .storage_context(|| "serializing snapshot stats".to_string())?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .storage_context(|| format!("writing stats file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .storage_context(|| format!("replacing stats file {}", path.display()))?;

        log::debug!("STATS: Wrote {} ({} records)", path.display(), self.total_records);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .storage_context(|| format!("reading stats file {}", path.display()))?;
        serde_json::from_str(&json).storage_context(|| format!("parsing stats file {}", path.display()))
    }
}

pub fn bool_facet_value(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
