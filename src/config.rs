//! Runtime configuration types.

use crate::jit::CompileOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Output format for compile statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for `tjit run`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log every translated instruction
    pub trace_jit: bool,
    /// Emit `int3` at every instruction boundary
    pub breakpoints: bool,
    /// Dump native code bytes to stderr after compiling
    pub dump_code: bool,
    pub stats: Option<StatsFormat>,
    /// Execution timeout in seconds (0 = no timeout)
    pub timeout: u64,
}

impl RuntimeConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            breakpoints: self.breakpoints,
            ..CompileOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::parse(
            r#"
            trace_jit = true
            breakpoints = true
            dump_code = true
            stats = "json"
            timeout = 5
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            RuntimeConfig {
                trace_jit: true,
                breakpoints: true,
                dump_code: true,
                stats: Some(StatsFormat::Json),
                timeout: 5,
            }
        );
        assert!(config.compile_options().breakpoints);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = RuntimeConfig::parse("dump_code = true").unwrap();
        assert!(config.dump_code);
        assert_eq!(config.stats, None);
        assert_eq!(config.timeout, 0);
        assert!(!config.compile_options().breakpoints);
    }

    #[test]
    fn test_unknown_stats_format_is_rejected() {
        let err = RuntimeConfig::parse(r#"stats = "xml""#).unwrap_err();
        assert!(err.starts_with("failed to parse config"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tjit.toml");
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(err.contains("failed to read"));
    }
}
