//! Configuration management for gary4local
//!
//! Provides TOML-based configuration with defaults and validation.
//! Location: ~/.gary4juce/config.toml

use crate::errors::{OrchestratorError, Result};
use crate::registry::{ArtifactSpec, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for gary4local
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub health: HealthConfig,
    pub download: DownloadConfig,
    pub credentials: CredentialsConfig,
    pub log: LogConfig,
    /// Artifact manifest keyed by service id
    pub artifacts: BTreeMap<String, Vec<ArtifactSpec>>,
}

/// File system locations and bootstrap tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub services_dir: String,
    pub state_file: String,
    pub python: String,
    pub git: String,
    /// Key-value store gary queues work through; empty means never launch one
    pub redis_server: String,
}

/// Health watcher budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub startup_attempts: u32,
    pub failure_threshold: u32,
    pub grace_timeout_secs: u64,
    /// How long a launched requirement gets to bind its port
    pub requirement_timeout_secs: u64,
}

/// Artifact download behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

/// Where the gated-artifact token comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub token_env: String,
}

/// Captured child output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub tail_lines: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            services_dir: "~/.gary4juce/services".to_string(),
            state_file: "~/.gary4juce/environments.json".to_string(),
            python: if cfg!(windows) { "python" } else { "python3" }.to_string(),
            git: "git".to_string(),
            redis_server: if cfg!(windows) { "redis-server.exe" } else { "redis-server" }.to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            startup_attempts: 120,
            failure_threshold: 3,
            grace_timeout_secs: 5,
            requirement_timeout_secs: 10,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            timeout_secs: 3600,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_env: "HF_TOKEN".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { tail_lines: 500 }
    }
}

impl Config {
    /// Load configuration from an explicit file, or from the standard
    /// location, creating a default file there if it doesn't exist
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(config_path) => Self::load_from_file(&config_path),
            None => {
                let config_path = Self::config_path()?;
                if !config_path.exists() {
                    let config = Config::default();
                    config.save(&config_path)?;
                    return Ok(config);
                }
                Self::load_from_file(&config_path)
            }
        }
    }

    /// Load configuration from specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| OrchestratorError::Config(format!("Failed to parse config {:?}: {}", path, e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| OrchestratorError::Config(format!("Failed to create config dir: {}", e)))?;
        }

        fs::write(path, contents)
            .map_err(|e| OrchestratorError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Get the standard configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| OrchestratorError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".gary4juce").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.health.interval_ms == 0 {
            return Err(OrchestratorError::Config(
                "health.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.startup_attempts == 0 || self.health.failure_threshold == 0 {
            return Err(OrchestratorError::Config(
                "health.startup_attempts and health.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.download.max_retries == 0 {
            return Err(OrchestratorError::Config(
                "download.max_retries must be at least 1".to_string(),
            ));
        }

        if self.log.tail_lines == 0 {
            return Err(OrchestratorError::Config(
                "log.tail_lines must be greater than 0".to_string(),
            ));
        }

        for (key, artifacts) in &self.artifacts {
            key.parse::<ServiceId>()?;
            for artifact in artifacts {
                let digest_ok = artifact.sha256.len() == 64
                    && artifact.sha256.chars().all(|c| c.is_ascii_hexdigit());
                if !digest_ok {
                    return Err(OrchestratorError::Config(format!(
                        "artifact '{}' of {} has an invalid sha256 digest",
                        artifact.name, key
                    )));
                }
                if Path::new(&artifact.name).is_absolute() || artifact.name.contains("..") {
                    return Err(OrchestratorError::Config(format!(
                        "artifact '{}' of {} must be a relative path inside the environment",
                        artifact.name, key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Expand tilde in paths
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    pub fn services_dir(&self) -> PathBuf {
        Self::expand_path(&self.paths.services_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        Self::expand_path(&self.paths.state_file)
    }

    /// Read the access token from the environment; blank counts as absent
    pub fn credential(&self) -> Option<String> {
        std::env::var(&self.credentials.token_env)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.health.grace_timeout_secs)
    }

    pub fn requirement_timeout(&self) -> Duration {
        Duration::from_secs(self.health.requirement_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.credentials.token_env, "HF_TOKEN");
        assert!(config.artifacts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_interval() {
        let mut config = Config::default();
        config.health.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_digest() {
        let mut config = Config::default();
        config.artifacts.insert(
            "gary".to_string(),
            vec![ArtifactSpec {
                name: "model.bin".to_string(),
                url: "https://example.invalid/model.bin".to_string(),
                sha256: "not-a-digest".to_string(),
                size: None,
                gated: false,
            }],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_unknown_service() {
        let mut config = Config::default();
        config.artifacts.insert("redis".to_string(), Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_escaping_artifact() {
        let mut config = Config::default();
        config.artifacts.insert(
            "jerry".to_string(),
            vec![ArtifactSpec {
                name: "../outside.bin".to_string(),
                url: "https://example.invalid/x".to_string(),
                sha256: "0".repeat(64),
                size: None,
                gated: false,
            }],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip_with_manifest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.health.startup_attempts = 7;
        config.artifacts.insert(
            "jerry".to_string(),
            vec![ArtifactSpec {
                name: "model.safetensors".to_string(),
                url: "https://example.invalid/model.safetensors".to_string(),
                sha256: "a".repeat(64),
                size: Some(42),
                gated: true,
            }],
        );
        config.save(&path).unwrap();

        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.health.startup_attempts, 7);
        assert_eq!(loaded.artifacts["jerry"][0].size, Some(42));
        assert!(loaded.artifacts["jerry"][0].gated);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[health]\ninterval_ms = 250\n").unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.health.interval_ms, 250);
        assert_eq!(loaded.health.failure_threshold, 3);
        assert_eq!(loaded.download.max_retries, 3);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = Config::expand_path("~/.gary4juce");
        assert!(!expanded.to_string_lossy().contains('~'));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = "/absolute/path";
        assert_eq!(Config::expand_path(path).to_string_lossy(), path);
    }
}
