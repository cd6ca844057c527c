//! Configuration schema and loader for the ringkv coordinator.

use serde::{Deserialize, Serialize};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Replication and quorum factors.
    #[serde(default)]
    pub quorum: QuorumConfig,

    /// Range-scan batch sizing.
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Replicas per row.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Successful replica reads required per tracking unit.
    #[serde(default = "default_read_factor")]
    pub read_factor: usize,

    /// Successful replica writes required per tracking unit.
    #[serde(default = "default_write_factor")]
    pub write_factor: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            read_factor: default_read_factor(),
            write_factor: default_write_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Rows requested by the first page of a scan.
    #[serde(default = "default_starting_batch_size")]
    pub starting_batch_size: usize,

    /// Upper bound for adaptively grown pages.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            starting_batch_size: default_starting_batch_size(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

// --- Defaults ---

fn default_replication_factor() -> usize {
    3
}
fn default_read_factor() -> usize {
    2
}
fn default_write_factor() -> usize {
    2
}
fn default_starting_batch_size() -> usize {
    100
}
fn default_max_batch_size() -> usize {
    10_000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl CoordinatorConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quorum;
        if q.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "quorum.replication_factor must be > 0".into(),
            ));
        }
        if q.read_factor == 0 || q.read_factor > q.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "quorum.read_factor ({}) must be in 1..={}",
                q.read_factor, q.replication_factor
            )));
        }
        if q.write_factor == 0 || q.write_factor > q.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "quorum.write_factor ({}) must be in 1..={}",
                q.write_factor, q.replication_factor
            )));
        }
        if self.scan.starting_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "scan.starting_batch_size must be > 0".into(),
            ));
        }
        if self.scan.max_batch_size < self.scan.starting_batch_size {
            return Err(ConfigError::Invalid(format!(
                "scan.max_batch_size ({}) must be >= scan.starting_batch_size ({})",
                self.scan.max_batch_size, self.scan.starting_batch_size
            )));
        }
        Ok(())
    }
}

/// Load a `CoordinatorConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<CoordinatorConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `CoordinatorConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = load_from_str("{}").unwrap();
        assert_eq!(config.quorum.replication_factor, 3);
        assert_eq!(config.quorum.read_factor, 2);
        assert_eq!(config.quorum.write_factor, 2);
        assert_eq!(config.scan.starting_batch_size, 100);
        assert_eq!(config.scan.max_batch_size, 10_000);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
quorum:
  replication_factor: 5
  read_factor: 3
  write_factor: 4
scan:
  starting_batch_size: 50
  max_batch_size: 400
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.quorum.replication_factor, 5);
        assert_eq!(config.quorum.read_factor, 3);
        assert_eq!(config.quorum.write_factor, 4);
        assert_eq!(config.scan.starting_batch_size, 50);
        assert_eq!(config.scan.max_batch_size, 400);
    }

    #[test]
    fn test_rejects_read_factor_above_replication() {
        let yaml = r#"
quorum:
  replication_factor: 3
  read_factor: 4
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("quorum.read_factor"), "unexpected error: {}", err);
    }

    #[test]
    fn test_rejects_zero_write_factor() {
        let yaml = r#"
quorum:
  write_factor: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("quorum.write_factor"), "unexpected error: {}", err);
    }

    #[test]
    fn test_rejects_zero_replication_factor() {
        let yaml = r#"
quorum:
  replication_factor: 0
  read_factor: 0
  write_factor: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(
            err.contains("quorum.replication_factor"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_rejects_max_batch_below_start() {
        let yaml = r#"
scan:
  starting_batch_size: 500
  max_batch_size: 100
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("scan.max_batch_size"), "unexpected error: {}", err);
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let result = load_from_str("quorum: [1, 2");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }
}
