//! Configuration for an analysis run.
//!
//! Defaults reproduce the standard behavior. Configurations can be stored as
//! JSON; missing fields take their default values.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ScathaError};

/// Floating-point emulator helpers whose broken fixups are only warnings.
pub const DEFAULT_EMULATOR_HELPERS: &[&str] = &[
    "FIARQQ", "FICRQQ", "FIDRQQ", "FIERQQ", "FISRQQ", "FIWRQQ", "FJARQQ", "FJCRQQ", "FJSRQQ",
];

/// Knobs for [`crate::analysis::analyze`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Recognize `jmp word ptr cs:[reg+table]` and probe the table.
    pub resolve_jump_tables: bool,
    /// Queue call targets for analysis.
    pub follow_calls: bool,
    /// End a block at IRET as if it were RET.
    pub iret_terminates: bool,
    /// Symbols whose misaligned fixups are downgraded to warnings.
    pub emulator_helpers: Vec<String>,
    /// Name procedures after the symbols at their entry points.
    pub name_procedures: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            resolve_jump_tables: true,
            follow_calls: true,
            iret_terminates: true,
            emulator_helpers: DEFAULT_EMULATOR_HELPERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            name_procedures: true,
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_emulator_helper(&self, name: &str) -> bool {
        self.emulator_helpers.iter().any(|h| h == name)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ScathaError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ScathaError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnalysisConfig::default();
        assert!(config.resolve_jump_tables);
        assert!(config.follow_calls);
        assert!(config.is_emulator_helper("FIDRQQ"));
        assert!(!config.is_emulator_helper("_printf"));
        assert_eq!(config.emulator_helpers.len(), 9);
    }

    #[test]
    fn test_json_roundtrip_and_partial() {
        let config = AnalysisConfig {
            follow_calls: false,
            ..AnalysisConfig::default()
        };
        let json = config.to_json_string().unwrap();
        assert_eq!(AnalysisConfig::from_json_str(&json).unwrap(), config);

        let partial = AnalysisConfig::from_json_str(r#"{"resolve_jump_tables": false}"#).unwrap();
        assert!(!partial.resolve_jump_tables);
        assert!(partial.name_procedures);
    }

    #[test]
    fn test_bad_json() {
        let err = AnalysisConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ScathaError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.json");
        std::fs::write(&path, r#"{"emulator_helpers": ["M_FTOL"]}"#).unwrap();
        let config = AnalysisConfig::from_json_file(&path).unwrap();
        assert_eq!(config.emulator_helpers, vec!["M_FTOL".to_string()]);
        assert!(AnalysisConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
