//! Runtime configuration of the mock backend.

use std::path::Path;

use medshare_shared::{MedshareResult, PaginationInput};
use serde::{Deserialize, Serialize};

/// 50 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Configuration for the backend and its facade
///
/// Stored as camelCase JSON; fields missing from the source take their
/// defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockConfig {
    /// Serve requests from the mock backend at all
    pub use_mock_data: bool,
    /// Artificial latency added by the facade, in milliseconds
    pub mock_delay_ms: u64,
    /// Log every routed facade call at debug level
    pub enable_mock_log: bool,
    /// Minimum patients and doctors before the user database is re-seeded
    pub seed_threshold: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Upper bound on an uploaded file, in bytes
    pub max_file_size: u64,
    /// Prefix stripped from facade urls
    pub api_base_path: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            use_mock_data: true,
            mock_delay_ms: 0,
            enable_mock_log: true,
            seed_threshold: 4,
            default_page_size: PaginationInput::DEFAULT_PAGE_SIZE,
            max_page_size: PaginationInput::MAX_PAGE_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            api_base_path: "/api".to_string(),
        }
    }
}

impl MockConfig {
    pub fn from_json_str(json: &str) -> MedshareResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> MedshareResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Set the artificial facade latency
    pub fn with_mock_delay_ms(mut self, ms: u64) -> Self {
        self.mock_delay_ms = ms;
        self
    }

    /// Set the re-seed threshold
    pub fn with_seed_threshold(mut self, threshold: usize) -> Self {
        self.seed_threshold = threshold;
        self
    }

    /// Set the upload size limit
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_page_sizes(mut self, default_size: usize, max_size: usize) -> Self {
        self.default_page_size = default_size;
        self.max_page_size = max_size;
        self
    }

    /// Resolve pagination input against the configured sizes
    pub fn page_of(&self, input: &PaginationInput) -> (usize, usize) {
        input.resolve(self.default_page_size, self.max_page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MockConfig::default();
        assert!(config.use_mock_data);
        assert_eq!(config.mock_delay_ms, 0);
        assert_eq!(config.seed_threshold, 4);
        assert_eq!(config.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.api_base_path, "/api");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"mockDelayMs": 300, "enableMockLog": false}"#;
        let config = MockConfig::from_json_str(json).unwrap();
        assert_eq!(config.mock_delay_ms, 300);
        assert!(!config.enable_mock_log);
        assert_eq!(config.default_page_size, 20);
    }

    #[test]
    fn test_bad_json_is_error() {
        let err = MockConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = MockConfig::from_file("/nonexistent/medshare/config.json").unwrap_err();
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn test_page_of_clamps() {
        let config = MockConfig::default().with_page_sizes(10, 50);
        assert_eq!(config.page_of(&PaginationInput::default()), (1, 10));
        assert_eq!(config.page_of(&PaginationInput::new(2, 500)), (2, 50));
    }
}
