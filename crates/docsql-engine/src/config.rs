//! Engine configuration
//!
//! Loaded from a YAML file; environment variables override file values:
//! - `DOCSQL_DIALECT`, `DOCSQL_TABLE_PREFIX`, `DOCSQL_MAX_BATCH_SIZE`
//! - `RUST_LOG`, `LOG_FORMAT`, `LOG_OUTPUT`, `LOG_DIR`

use docsql_dialect::{Dialect, DialectError};
use docsql_translate::TranslatorOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Dialect(#[from] DialectError),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Sandbox worker settings for `$function` batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Prepended to the SHA-256 of the function body to name its worker
    pub worker_name_prefix: String,
    pub compatibility_date: String,
    /// Upper bound on argument tuples per sandbox request
    pub max_batch_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: "fn-".to_string(),
            compatibility_date: "2024-09-23".to_string(),
            max_batch_size: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dialect: Dialect,
    pub translator: TranslatorOptions,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Override file values with any environment variables that are set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dialect) = std::env::var("DOCSQL_DIALECT") {
            self.dialect = dialect.parse()?;
        }
        if let Ok(prefix) = std::env::var("DOCSQL_TABLE_PREFIX") {
            self.translator.table_prefix = prefix;
        }
        if let Ok(size) = std::env::var("DOCSQL_MAX_BATCH_SIZE") {
            self.sandbox.max_batch_size = match size.parse() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidEnvVar {
                        name: "DOCSQL_MAX_BATCH_SIZE".to_string(),
                        value: size,
                    })
                }
            };
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert_eq!(config.translator.document_column, "data");
        assert_eq!(config.sandbox.max_batch_size, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "stdout");
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml(
            r#"
dialect: clickhouse
translator:
  table_prefix: "tenant_"
sandbox:
  max_batch_size: 50
"#,
        )
        .unwrap();
        assert_eq!(config.dialect, Dialect::ClickHouse);
        assert_eq!(config.translator.table_prefix, "tenant_");
        assert_eq!(config.translator.document_column, "data");
        assert_eq!(config.sandbox.max_batch_size, 50);
        assert_eq!(config.sandbox.worker_name_prefix, "fn-");
    }

    #[test]
    fn test_invalid_dialect() {
        let err = EngineConfig::from_yaml("dialect: postgres").unwrap_err();
        assert!(err.to_string().contains("postgres"), "{}", err);
    }

    #[test]
    fn test_env_var_override() {
        std::env::set_var("DOCSQL_DIALECT", "clickhouse");
        std::env::set_var("DOCSQL_MAX_BATCH_SIZE", "25");

        let config_yaml = r#"
dialect: sqlite
translator:
  table_prefix: "app_"
"#;
        let temp_file = std::env::temp_dir().join("docsql_test_config.yaml");
        std::fs::write(&temp_file, config_yaml).unwrap();

        let config = EngineConfig::load(&temp_file).unwrap();
        assert_eq!(config.dialect, Dialect::ClickHouse); // Overridden
        assert_eq!(config.sandbox.max_batch_size, 25); // Overridden
        assert_eq!(config.translator.table_prefix, "app_");

        std::env::set_var("DOCSQL_MAX_BATCH_SIZE", "0");
        assert!(matches!(
            EngineConfig::load(&temp_file),
            Err(ConfigError::InvalidEnvVar { .. })
        ));

        std::env::remove_var("DOCSQL_DIALECT");
        std::env::remove_var("DOCSQL_MAX_BATCH_SIZE");
        std::fs::remove_file(temp_file).ok();
    }
}
