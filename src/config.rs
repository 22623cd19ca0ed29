//! Store configuration from environment variables

use std::env;
use std::path::PathBuf;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CURSOR_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_OPEN_READERS: usize = 64;

/// Configuration for the validation statistics store
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Root directory holding per-network snapshot storage
    pub base_path: PathBuf,

    /// Records per executed batch inside one insert transaction
    pub batch_size: usize,

    /// Collect rule occurrence values for drill-down reports
    pub detailed_diagnose: bool,

    /// Rows fetched per cursor advancement in `stream_all`
    pub cursor_page_size: usize,

    /// Read-only handles kept cached before idle ones are closed
    pub max_open_readers: usize,
}

impl StatsConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            detailed_diagnose: false,
            cursor_page_size: DEFAULT_CURSOR_PAGE_SIZE,
            max_open_readers: DEFAULT_MAX_OPEN_READERS,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `STORE_BASEPATH` (default: /tmp/data/)
    /// - `VALIDATION_BATCH_SIZE` (default: 1000)
    /// - `VALIDATION_DETAILED_DIAGNOSE` (default: false)
    /// - `VALIDATION_CURSOR_PAGE_SIZE` (default: 1000)
    /// - `VALIDATION_MAX_OPEN_READERS` (default: 64)
    pub fn from_env() -> Self {
        Self {
            base_path: env::var("STORE_BASEPATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/data/")),

            batch_size: env::var("VALIDATION_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),

            detailed_diagnose: env::var("VALIDATION_DETAILED_DIAGNOSE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),

            cursor_page_size: env::var("VALIDATION_CURSOR_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(DEFAULT_CURSOR_PAGE_SIZE),

            max_open_readers: env::var("VALIDATION_MAX_OPEN_READERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|count: &usize| *count > 0)
                .unwrap_or(DEFAULT_MAX_OPEN_READERS),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_detailed_diagnose(mut self, enabled: bool) -> Self {
        self.detailed_diagnose = enabled;
        self
    }

    pub fn with_cursor_page_size(mut self, page_size: usize) -> Self {
        self.cursor_page_size = page_size.max(1);
        self
    }

    pub fn with_max_open_readers(mut self, count: usize) -> Self {
        self.max_open_readers = count.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both env scenarios share one test so parallel test threads never race on
    // the same variables.
    #[test]
    fn test_config_from_env() {
        env::remove_var("STORE_BASEPATH");
        env::remove_var("VALIDATION_BATCH_SIZE");
        env::remove_var("VALIDATION_DETAILED_DIAGNOSE");
        env::remove_var("VALIDATION_CURSOR_PAGE_SIZE");
        env::remove_var("VALIDATION_MAX_OPEN_READERS");

        let config = StatsConfig::from_env();
        assert_eq!(config.base_path, PathBuf::from("/tmp/data/"));
        assert_eq!(config.batch_size, 1000);
        assert!(!config.detailed_diagnose);
        assert_eq!(config.cursor_page_size, 1000);
        assert_eq!(config.max_open_readers, 64);

        env::set_var("STORE_BASEPATH", "/srv/lrharvester");
        env::set_var("VALIDATION_BATCH_SIZE", "250");
        env::set_var("VALIDATION_DETAILED_DIAGNOSE", "true");
        env::set_var("VALIDATION_CURSOR_PAGE_SIZE", "0");
        env::set_var("VALIDATION_MAX_OPEN_READERS", "8");

        let config = StatsConfig::from_env();
        assert_eq!(config.base_path, PathBuf::from("/srv/lrharvester"));
        assert_eq!(config.batch_size, 250);
        assert!(config.detailed_diagnose);
        assert_eq!(config.cursor_page_size, 1000);
        assert_eq!(config.max_open_readers, 8);

        env::remove_var("STORE_BASEPATH");
        env::remove_var("VALIDATION_BATCH_SIZE");
        env::remove_var("VALIDATION_DETAILED_DIAGNOSE");
        env::remove_var("VALIDATION_CURSOR_PAGE_SIZE");
        env::remove_var("VALIDATION_MAX_OPEN_READERS");
    }

    #[test]
    fn test_builder_clamps_sizes() {
        let config = StatsConfig::new("/data")
            .with_batch_size(0)
            .with_cursor_page_size(0)
            .with_max_open_readers(0)
            .with_detailed_diagnose(true);

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.cursor_page_size, 1);
        assert_eq!(config.max_open_readers, 1);
        assert!(config.detailed_diagnose);
    }
}
