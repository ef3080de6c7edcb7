use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Bridge-level configuration.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name passed to the host with every callback.
    pub extension_name: String,
    /// String returned by the version entry point.
    pub version: String,
    /// Worker threads of the multi-thread runtime.
    pub worker_threads: usize,
    /// Maximum async invocations in flight before new ones are refused.
    pub max_in_flight: usize,
    /// Size of the host's reply buffer in bytes, terminator included.
    pub output_capacity: usize,
    pub log: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            extension_name: "extcall".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            worker_threads: 4,
            max_in_flight: 1024,
            output_capacity: 20_480,
            log: LogConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Loads a JSON config file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Logging settings, applied by [`crate::logging::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.extension_name, "extcall");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_in_flight, 1024);
        assert_eq!(config.output_capacity, 20_480);
        assert_eq!(config.log.filter, "info");
        assert!(!config.log.json);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"extension_name":"demo","log":{"json":true}}"#).unwrap();
        assert_eq!(config.extension_name, "demo");
        assert_eq!(config.worker_threads, 4);
        assert!(config.log.json);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = BridgeConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extcall.json");
        std::fs::write(&path, r#"{"max_in_flight": 8}"#).unwrap();
        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.max_in_flight, 8);
    }

    #[test]
    fn from_file_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = BridgeConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("parsing config file"));
    }
}
