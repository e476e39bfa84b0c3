use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CONFIG_NAME: &str = "arbor.session.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How a second pending value change on the same property is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueConflict {
    /// The later change replaces the earlier one
    #[default]
    LastWriterWins,
    /// The later change fails with a constraint violation
    Reject,
}

/// Session configuration file format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Workspace name, part of the seed for session-local ids
    #[serde(default = "default_workspace")]
    pub workspace: String,

    #[serde(default)]
    pub value_conflict: ValueConflict,

    /// Probe the remote store for staleness before submitting a batch
    #[serde(default = "default_refresh_before_save")]
    pub refresh_before_save: bool,

    /// Maximum pending operations (0 = unlimited)
    #[serde(default)]
    pub max_change_log_entries: usize,
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_refresh_before_save() -> bool {
    true
}

impl SessionConfig {
    /// Load config from a directory, falling back to defaults when absent
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = dir.as_ref().join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_json_str(&content)
        } else {
            Ok(SessionConfig::default())
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_value_conflict(mut self, policy: ValueConflict) -> Self {
        self.value_conflict = policy;
        self
    }

    pub fn with_refresh_before_save(mut self, enabled: bool) -> Self {
        self.refresh_before_save = enabled;
        self
    }

    pub fn with_max_change_log_entries(mut self, max: usize) -> Self {
        self.max_change_log_entries = max;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            value_conflict: ValueConflict::default(),
            refresh_before_save: default_refresh_before_save(),
            max_change_log_entries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "workspace": "content",
            "valueConflict": "reject",
            "refreshBeforeSave": false,
            "maxChangeLogEntries": 50
        }"#;

        let config = SessionConfig::from_json_str(json).unwrap();
        assert_eq!(config.workspace, "content");
        assert_eq!(config.value_conflict, ValueConflict::Reject);
        assert!(!config.refresh_before_save);
        assert_eq!(config.max_change_log_entries, 50);
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.workspace, "default");
        assert_eq!(config.value_conflict, ValueConflict::LastWriterWins);
        assert!(config.refresh_before_save);
        assert_eq!(config.max_change_log_entries, 0);
    }

    #[test]
    fn test_invalid_config() {
        let err = SessionConfig::from_json_str(r#"{ "valueConflict": "merge" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();

        // Missing file falls back to defaults
        assert_eq!(SessionConfig::load(dir.path()).unwrap(), SessionConfig::default());

        std::fs::write(dir.path().join(DEFAULT_CONFIG_NAME), r#"{ "workspace": "drafts" }"#).unwrap();
        let config = SessionConfig::load(dir.path()).unwrap();
        assert_eq!(config.workspace, "drafts");
        assert!(config.refresh_before_save);
    }
}
