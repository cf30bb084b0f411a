//! Audit log configuration
//!
//! Selects, per log kind, whether records are echoed to the console,
//! appended to a rotating file, and whether raw payloads are captured.

use crate::error::{Result, TxLogError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable holding a JSON overlay for [`LogConfig`]
pub const CONFIG_LOG_ENV: &str = "CONFIG_LOG";

/// Top-level audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Application name written into every record
    pub project_name: String,

    /// Deployment namespace written into the record envelope
    pub namespace: String,

    /// Summary log sinks
    pub summary: SinkConfig,

    /// Detail log sinks
    pub detail: SinkConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            project_name: env!("CARGO_PKG_NAME").to_string(),
            namespace: "default".to_string(),
            summary: SinkConfig {
                path: PathBuf::from("./logs/summary/"),
                raw_data: false,
                ..Default::default()
            },
            detail: SinkConfig {
                path: PathBuf::from("./logs/detail/"),
                raw_data: true,
                ..Default::default()
            },
        }
    }
}

impl LogConfig {
    /// Defaults overlaid with the JSON in `CONFIG_LOG`, if set
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(CONFIG_LOG_ENV) {
            config.apply_json_overlay(&raw)?;
            tracing::debug!(
                project = %config.project_name,
                namespace = %config.namespace,
                "Log config overlaid from environment"
            );
        }
        Ok(config)
    }

    /// Merge a partial JSON document into this config.
    ///
    /// Only keys present in the overlay are replaced; nested `detail` and
    /// `summary` objects merge field by field.
    pub fn apply_json_overlay(&mut self, overlay: &str) -> Result<()> {
        let overlay: serde_json::Value = serde_json::from_str(overlay)?;
        if !overlay.is_object() {
            return Err(TxLogError::Config(format!(
                "{} must be a JSON object",
                CONFIG_LOG_ENV
            )));
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, &overlay);
        *self = serde_json::from_value(current)?;
        Ok(())
    }

    /// Builder-style project name override
    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }
}

/// Output settings for one log kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkConfig {
    /// Echo each record to stdout
    pub console: bool,

    /// Append each record to a rotating file under `path`
    pub file: bool,

    /// Directory for the rotating file
    pub path: PathBuf,

    /// Capture `RawData` alongside the structured payload
    pub raw_data: bool,

    /// Rotate once the active file grows past this many bytes
    pub max_file_bytes: u64,

    /// Rotate when the calendar day changes
    pub rotate_daily: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            console: true,
            file: false,
            path: PathBuf::from("./logs/"),
            raw_data: false,
            max_file_bytes: 10 * 1024 * 1024, // 10 MB
            rotate_daily: true,
        }
    }
}

fn merge_json(target: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (target, overlay) {
        (serde_json::Value::Object(target), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.namespace, "default");
        assert!(config.detail.console);
        assert!(!config.detail.file);
        assert!(config.detail.raw_data);
        assert!(!config.summary.raw_data);
        assert_eq!(config.summary.path, PathBuf::from("./logs/summary/"));
        assert_eq!(config.detail.max_file_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_overlay_merges_partial_sections() {
        let mut config = LogConfig::default();
        config
            .apply_json_overlay(
                r#"{"projectName":"auth-service","detail":{"file":true,"rawData":false}}"#,
            )
            .unwrap();

        assert_eq!(config.project_name, "auth-service");
        assert!(config.detail.file);
        assert!(!config.detail.raw_data);
        // untouched fields keep their defaults
        assert!(config.detail.console);
        assert_eq!(config.detail.path, PathBuf::from("./logs/detail/"));
        assert!(!config.summary.file);
    }

    #[test]
    fn test_overlay_rejects_non_object() {
        let mut config = LogConfig::default();
        let err = config.apply_json_overlay("[1,2]").unwrap_err();
        assert!(matches!(err, TxLogError::Config(_)));
    }

    #[test]
    fn test_overlay_rejects_invalid_json() {
        let mut config = LogConfig::default();
        let err = config.apply_json_overlay("{not json").unwrap_err();
        assert!(matches!(err, TxLogError::Serialization(_)));
    }

    #[test]
    fn test_config_serialization_is_camel_case() {
        let json = serde_json::to_string(&LogConfig::default()).unwrap();
        assert!(json.contains("\"projectName\""));
        assert!(json.contains("\"rawData\""));
        assert!(json.contains("\"maxFileBytes\""));
    }
}
