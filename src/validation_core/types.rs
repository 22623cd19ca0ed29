//! Record-level data carried in and out of the validation store

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type SnapshotId = i64;
pub type RuleId = i64;

/// Storage format for datestamps (ISO local date-time, second precision)
pub const DATESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_datestamp(datestamp: &NaiveDateTime) -> String {
    datestamp.format(DATESTAMP_FORMAT).to_string()
}

pub fn parse_datestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// One row per harvested record per snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Stable hash of the OAI identifier, unique within a snapshot
    pub identifier_hash: String,
    pub identifier: String,
    pub datestamp: Option<NaiveDateTime>,
    pub is_valid: bool,
    pub is_transformed: bool,
    pub published_metadata_hash: Option<String>,
    pub rule_results: BTreeMap<RuleId, bool>,
}

impl ValidationRecord {
    pub fn new(identifier_hash: impl Into<String>, identifier: impl Into<String>, is_valid: bool) -> Self {
        Self {
            identifier_hash: identifier_hash.into(),
            identifier: identifier.into(),
            datestamp: None,
            is_valid,
            is_transformed: false,
            published_metadata_hash: None,
            rule_results: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, rule_id: RuleId, is_valid: bool) -> Self {
        self.rule_results.insert(rule_id, is_valid);
        self
    }

    pub fn with_transformed(mut self, is_transformed: bool) -> Self {
        self.is_transformed = is_transformed;
        self
    }

    pub fn with_datestamp(mut self, datestamp: NaiveDateTime) -> Self {
        self.datestamp = Some(datestamp);
        self
    }

    pub fn valid_rule_ids(&self) -> Vec<RuleId> {
        self.rule_results
            .iter()
            .filter(|(_, valid)| **valid)
            .map(|(rule_id, _)| *rule_id)
            .collect()
    }

    pub fn invalid_rule_ids(&self) -> Vec<RuleId> {
        self.rule_results
            .iter()
            .filter(|(_, valid)| !**valid)
            .map(|(rule_id, _)| *rule_id)
            .collect()
    }
}

/// One tested field value for one rule on one record (detailed mode only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOccurrence {
    pub identifier_hash: String,
    pub rule_id: RuleId,
    pub is_valid: bool,
    pub occurrence_value: Option<String>,
}

/// Field values a rule accepted and rejected for one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceValues {
    pub valid_values: Vec<String>,
    pub invalid_values: Vec<String>,
}

/// Finished per-record verdict handed over by the rule-evaluation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub identifier: String,
    pub identifier_hash: String,
    pub datestamp: Option<NaiveDateTime>,
    pub is_valid: bool,
    pub is_transformed: bool,
    pub published_metadata_hash: Option<String>,
    pub rule_results: BTreeMap<RuleId, bool>,
    /// Only populated when the evaluator ran in detailed mode
    #[serde(default)]
    pub occurrences: BTreeMap<RuleId, OccurrenceValues>,
}

impl RecordOutcome {
    pub fn to_record(&self) -> ValidationRecord {
        ValidationRecord {
            identifier_hash: self.identifier_hash.clone(),
            identifier: self.identifier.clone(),
            datestamp: self.datestamp,
            is_valid: self.is_valid,
            is_transformed: self.is_transformed,
            published_metadata_hash: self.published_metadata_hash.clone(),
            rule_results: self.rule_results.clone(),
        }
    }

    /// Flatten the per-rule value lists into occurrence rows, valid values first
    pub fn rule_occurrences(&self) -> Vec<RuleOccurrence> {
        let mut rows = Vec::new();
        for (rule_id, values) in &self.occurrences {
            let valid = values.valid_values.iter().map(|v| (true, v));
            let invalid = values.invalid_values.iter().map(|v| (false, v));
            for (is_valid, value) in valid.chain(invalid) {
                rows.push(RuleOccurrence {
                    identifier_hash: self.identifier_hash.clone(),
                    rule_id: *rule_id,
                    is_valid,
                    occurrence_value: Some(value.clone()),
                });
            }
        }
        rows
    }
}

/// Listing row returned by paginated queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationObservation {
    pub id: String,
    pub identifier: String,
    pub snapshot_id: SnapshotId,
    pub is_valid: bool,
    pub is_transformed: bool,
    pub valid_rules_ids: Vec<RuleId>,
    pub invalid_rules_ids: Vec<RuleId>,
}

impl ValidationObservation {
    pub fn from_record(snapshot_id: SnapshotId, record: &ValidationRecord) -> Self {
        Self {
            id: record.identifier_hash.clone(),
            identifier: record.identifier.clone(),
            snapshot_id,
            is_valid: record.is_valid,
            is_transformed: record.is_transformed,
            valid_rules_ids: record.valid_rule_ids(),
            invalid_rules_ids: record.invalid_rule_ids(),
        }
    }
}

/// One page of results plus the total for the same filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub size: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        self.total.div_ceil(self.size as u64)
    }
}

/// Occurrence value with how many times it was seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceCount {
    pub value: Option<String>,
    pub count: u64,
}

/// Drill-down for one rule, each list sorted by count descending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOccurrenceCounts {
    pub valid_rule_occrs: Vec<OccurrenceCount>,
    pub invalid_rule_occrs: Vec<OccurrenceCount>,
}

/// Outcome of one rule on one record, with its occurrence values if stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFact {
    pub rule_id: RuleId,
    pub is_valid: bool,
    pub valid_occurrences: Vec<String>,
    pub invalid_occurrences: Vec<String>,
}

/// Per-record diagnostic view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValidation {
    pub identifier: String,
    pub datestamp: Option<NaiveDateTime>,
    pub is_valid: bool,
    pub is_transformed: bool,
    pub published_metadata_hash: Option<String>,
    pub rule_facts: Vec<RuleFact>,
}

/// Per-snapshot lifecycle position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Uninitialized,
    /// Schema created, rules registered, nothing written yet
    Initializing,
    Writing,
    Finalized,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_datestamp_round_trip() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 20, 30)
            .unwrap();
        let raw = format_datestamp(&ts);
        assert_eq!(raw, "2024-03-15T10:20:30");
        assert_eq!(parse_datestamp(&raw), Some(ts));
        assert_eq!(parse_datestamp("2024-03-15T10:20:30.250").map(|d| d.date()), Some(ts.date()));
        assert_eq!(parse_datestamp("yesterday"), None);
    }

    #[test]
    fn test_outcome_flattens_occurrences() {
        let mut occurrences = BTreeMap::new();
        occurrences.insert(
            10,
            OccurrenceValues {
                valid_values: vec!["en".to_string()],
                invalid_values: vec!["xx".to_string(), "yy".to_string()],
            },
        );
        let outcome = RecordOutcome {
            identifier: "oai:repo:1".to_string(),
            identifier_hash: "h1".to_string(),
            datestamp: None,
            is_valid: false,
            is_transformed: false,
            published_metadata_hash: None,
            rule_results: BTreeMap::from([(10, false)]),
            occurrences,
        };

        let rows = outcome.rule_occurrences();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_valid);
        assert_eq!(rows[0].occurrence_value.as_deref(), Some("en"));
        assert!(rows[1..].iter().all(|r| !r.is_valid && r.rule_id == 10));
    }

    #[test]
    fn test_observation_splits_rules() {
        let record = ValidationRecord::new("h", "oai:x", false)
            .with_rule(3, true)
            .with_rule(1, false)
            .with_rule(2, true);
        let obs = ValidationObservation::from_record(9, &record);
        assert_eq!(obs.valid_rules_ids, vec![2, 3]);
        assert_eq!(obs.invalid_rules_ids, vec![1]);
        assert_eq!(obs.snapshot_id, 9);
    }

    #[test]
    fn test_page_total_pages() {
        let page: Page<u8> = Page { items: vec![], total: 21, page: 0, size: 10 };
        assert_eq!(page.total_pages(), 3);
    }
}
