//! Interpreter limits and switches.
//!
//! A [`VdbeConfig`] is built in code or loaded from a JSON document. Every
//! field has a default, so a document only needs the keys it overrides:
//!
//! ```json
//! { "max_length": 1048576, "query_only": true }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlvm_error::Result;
use tracing::debug;

/// Default upper bound on the byte length of a string or blob.
pub const DEFAULT_MAX_LENGTH: usize = 1_000_000_000;

/// Default nesting limit for sub-program frames.
pub const DEFAULT_MAX_FRAME_DEPTH: usize = 1000;

/// Default frame memory budget (64 MiB).
pub const DEFAULT_FRAME_MEMORY_BUDGET: usize = 64 * 1024 * 1024;

/// Per-connection interpreter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdbeConfig {
    /// Largest string or blob any opcode may produce.
    pub max_length: usize,
    /// Maximum number of nested `Program` frames.
    pub max_frame_depth: usize,
    /// Approximate bytes all saved frames may hold together.
    pub frame_memory_budget: usize,
    /// Reject write transactions.
    pub query_only: bool,
    /// Report row-change counts for data-modifying programs.
    pub count_changes: bool,
    /// Emit a `trace!` event for every dispatched instruction.
    pub vdbe_trace: bool,
    /// Instructions between progress-handler calls; 0 disables the handler.
    pub progress_ops: u64,
}

impl Default for VdbeConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_frame_depth: DEFAULT_MAX_FRAME_DEPTH,
            frame_memory_budget: DEFAULT_FRAME_MEMORY_BUDGET,
            query_only: false,
            count_changes: false,
            vdbe_trace: false,
            progress_ops: 0,
        }
    }
}

impl VdbeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        debug!(?config, "configuration parsed");
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        debug!(path = %path.display(), bytes = raw.len(), "configuration file read");
        Self::from_json_str(&raw)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VdbeConfig::default();
        assert_eq!(config.max_length, 1_000_000_000);
        assert_eq!(config.max_frame_depth, 1000);
        assert_eq!(config.frame_memory_budget, 64 * 1024 * 1024);
        assert!(!config.query_only);
        assert_eq!(config.progress_ops, 0);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = VdbeConfig::from_json_str(r#"{"query_only": true, "progress_ops": 10}"#).unwrap();
        assert!(config.query_only);
        assert_eq!(config.progress_ops, 10);
        assert_eq!(config.max_length, DEFAULT_MAX_LENGTH);
    }

    #[test]
    fn test_bad_document_is_config_error() {
        let err = VdbeConfig::from_json_str(r#"{"max_length": "big"}"#).unwrap_err();
        assert!(matches!(err, sqlvm_error::SqlvmError::Config(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = VdbeConfig {
            max_length: 99,
            vdbe_trace: true,
            ..VdbeConfig::default()
        };
        let json = config.to_json_string().unwrap();
        assert_eq!(VdbeConfig::from_json_str(&json).unwrap(), config);
    }
}
