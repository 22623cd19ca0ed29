//! Snapshot validation statistics store
//!
//! Persists per-record validation outcomes for each harvesting snapshot,
//! maintains aggregate counters as batches commit, and serves aggregate,
//! filtered, paginated and drill-down queries.

pub mod config;
pub mod error;
pub mod paths;
pub mod service;
pub mod sqlite_pragma;
pub mod validation_core;

pub use config::StatsConfig;
pub use error::{ErrorClass, Result, StatsError};
pub use paths::{NetworkResolver, StaticNetworkResolver};
pub use service::ValidationStatsService;
