use std::path::Path;

use serde::{Deserialize, Serialize};
use treewatch::{ConfigError, WatchSettings};

/// Contents of the `--config` file.
///
/// ```toml
/// [watch]
/// close_grace_ms = 250
/// default_overflow = "diff"
///
/// [logging]
/// level = "treewatch=debug"
/// json = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub watch: WatchSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,
    /// Emit log lines as JSON.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            json: false,
        }
    }
}

impl CliConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: CliConfig = toml::from_str(text)?;
        config.watch.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treewatch::Approximation;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CliConfig::load_from_str("").unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn reads_both_sections() {
        let config = CliConfig::load_from_str(
            r#"
            [watch]
            close_grace_ms = 250
            default_overflow = "diff"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.watch.close_grace_ms, 250);
        assert_eq!(config.watch.default_overflow, Approximation::Diff);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn rejects_unknown_keys_and_invalid_values() {
        let err = CliConfig::load_from_str("[logging]\nlevle = \"debug\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)), "{err}");

        let err = CliConfig::load_from_str("[watch]\nraw_queue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("treewatch.toml");
        std::fs::write(&path, "[logging]\njson = true\n").unwrap();
        assert!(CliConfig::load_from_path(&path).unwrap().logging.json);

        let err = CliConfig::load_from_path(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "{err}");
    }
}
