//! Validation Core - Snapshot Validation Statistics Store
//!
//! Persists one outcome row per record per harvesting snapshot, keeps aggregate
//! counters in step with the rows, and answers filtered, paginated and faceted
//! queries without materializing a snapshot in memory.
//!
//! # Architecture
//!
//! ```text
//! validation worker → records::write_batch (one transaction per batch)
//!     ↓ commit
//! SnapshotValidationStats (in-memory counters)
//!     ↓ finalize
//! validation-stats.json  ← unfiltered aggregate reads
//!
//! validation.db (record_validation + rule_results [+ rule_occurrences])
//!     ↓
//! query::aggregate_stats / query_page / occurrences (SQL pushdown)
//! RecordCursor → query::aggregate_by_scan (streaming)
//! ```

pub mod cursor;
pub mod filter;
pub mod lifecycle;
pub mod occurrences;
pub mod paginator;
pub mod query;
pub mod records;
pub mod schema;
pub mod stats;
pub mod types;

pub use cursor::RecordCursor;
pub use filter::{FilterTerm, RecordFilter};
pub use lifecycle::{OpenStore, SnapshotRegistry};
pub use paginator::ValidationRecordPaginator;
pub use stats::{RuleStats, SnapshotValidationStats};
pub use types::{
    OccurrenceCount, OccurrenceValues, Page, RecordOutcome, RecordValidation, RuleFact, RuleId, RuleOccurrence,
    RuleOccurrenceCounts, SnapshotId, SnapshotState, ValidationObservation, ValidationRecord,
};
