//! Filter term parsing
//!
//! Terms look like `field:value` or `field@@value` (the latter survives URL
//! encoding). The same parsed filter is rendered as a SQL condition over
//! `record_validation r` and evaluated in memory for streaming scans; both
//! must select exactly the same records.

use super::types::{RuleId, ValidationRecord};
use crate::error::{Result, StatsError};
use rusqlite::types::Value;

const URL_SAFE_SEPARATOR: &str = "@@";
const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterTerm {
    /// Substring of the OAI identifier, case-sensitive
    IdentifierContains(String),
    IsValid(bool),
    IsTransformed(bool),
    /// Record passed this rule
    ValidRule(RuleId),
    /// Record failed this rule
    InvalidRule(RuleId),
}

impl FilterTerm {
    pub fn parse(raw: &str) -> Result<Option<FilterTerm>> {
        let cleaned = raw.replace('"', "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }

        let (field, value) = cleaned
            .split_once(URL_SAFE_SEPARATOR)
            .or_else(|| cleaned.split_once(SEPARATOR))
            .ok_or_else(|| StatsError::invalid_filter(raw, "expected field:value or field@@value"))?;
        let field = field.trim();
        let value = value.trim();

        let term = match field {
            "identifier" => FilterTerm::IdentifierContains(value.to_string()),
            "is_valid" | "record_is_valid" | "isValid" => FilterTerm::IsValid(parse_bool(raw, value)?),
            "is_transformed" | "record_is_transformed" | "isTransformed" => {
                FilterTerm::IsTransformed(parse_bool(raw, value)?)
            }
            "valid_rules" => FilterTerm::ValidRule(parse_rule_id(raw, value)?),
            "invalid_rules" => FilterTerm::InvalidRule(parse_rule_id(raw, value)?),
            other => {
                return Err(StatsError::invalid_filter(raw, format!("unknown field '{}'", other)));
            }
        };
        Ok(Some(term))
    }

    pub fn matches(&self, record: &ValidationRecord) -> bool {
        match self {
            FilterTerm::IdentifierContains(needle) => record.identifier.contains(needle.as_str()),
            FilterTerm::IsValid(expected) => record.is_valid == *expected,
            FilterTerm::IsTransformed(expected) => record.is_transformed == *expected,
            FilterTerm::ValidRule(rule_id) => record.rule_results.get(rule_id) == Some(&true),
            FilterTerm::InvalidRule(rule_id) => record.rule_results.get(rule_id) == Some(&false),
        }
    }

    fn push_sql(&self, conditions: &mut Vec<&'static str>, params: &mut Vec<Value>) {
        match self {
            FilterTerm::IdentifierContains(needle) => {
                conditions.push("instr(r.identifier, ?) > 0");
                params.push(Value::Text(needle.clone()));
            }
            FilterTerm::IsValid(expected) => {
                conditions.push("r.is_valid = ?");
                params.push(Value::Integer(*expected as i64));
            }
            FilterTerm::IsTransformed(expected) => {
                conditions.push("r.is_transformed = ?");
                params.push(Value::Integer(*expected as i64));
            }
            FilterTerm::ValidRule(rule_id) => {
                conditions.push(
                    "EXISTS (SELECT 1 FROM rule_results f \
                     WHERE f.identifier_hash = r.identifier_hash AND f.rule_id = ? AND f.is_valid = 1)",
                );
                params.push(Value::Integer(*rule_id));
            }
            FilterTerm::InvalidRule(rule_id) => {
                conditions.push(
                    "EXISTS (SELECT 1 FROM rule_results f \
                     WHERE f.identifier_hash = r.identifier_hash AND f.rule_id = ? AND f.is_valid = 0)",
                );
                params.push(Value::Integer(*rule_id));
            }
        }
    }
}

fn parse_bool(raw: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(StatsError::invalid_filter(raw, format!("'{}' is not a boolean", value)))
    }
}

fn parse_rule_id(raw: &str, value: &str) -> Result<RuleId> {
    value
        .parse::<RuleId>()
        .map_err(|_| StatsError::invalid_filter(raw, format!("'{}' is not a rule id", value)))
}

/// Conjunction of filter terms; empty matches every record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    terms: Vec<FilterTerm>,
}

/// WHERE condition with positional parameters, in order
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCondition {
    pub sql: String,
    pub params: Vec<Value>,
}

impl RecordFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(terms: Vec<FilterTerm>) -> Self {
        Self { terms }
    }

    /// Parse every term, failing on the first malformed one; blank terms are skipped
    pub fn parse<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        let mut terms = Vec::with_capacity(filters.len());
        for raw in filters {
            if let Some(term) = FilterTerm::parse(raw.as_ref())? {
                terms.push(term);
            }
        }
        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[FilterTerm] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, record: &ValidationRecord) -> bool {
        self.terms.iter().all(|term| term.matches(record))
    }

    /// Condition over `record_validation` aliased as `r`
    pub fn to_sql(&self) -> SqlCondition {
        if self.terms.is_empty() {
            return SqlCondition {
                sql: "1 = 1".to_string(),
                params: Vec::new(),
            };
        }

        let mut conditions = Vec::with_capacity(self.terms.len());
        let mut params = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            term.push_sql(&mut conditions, &mut params);
        }
        SqlCondition {
            sql: conditions.join(" AND "),
            params,
        }
    }
}
