use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CleanerError, Result};

/// Gmail `batchModify` accepts at most this many ids per call
pub const MAX_BATCH_SIZE: usize = 1000;

pub const SCOPE_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
pub const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Headless mode: return the authorization URL instead of opening
    /// an interactive prompt, and accept callbacks on all interfaces
    #[serde(default)]
    pub web_auth: bool,
    #[serde(default = "default_oauth_host")]
    pub oauth_host: String,
    #[serde(default = "default_oauth_port")]
    pub oauth_port: u16,
    /// Port advertised in the redirect URI when the listener sits behind
    /// a port mapping
    #[serde(default)]
    pub oauth_external_port: Option<u16>,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_file: default_token_file(),
            data_dir: default_data_dir(),
            web_auth: false,
            oauth_host: default_oauth_host(),
            oauth_port: default_oauth_port(),
            oauth_external_port: None,
            callback_timeout_secs: default_callback_timeout_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            scopes: default_scopes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_quota_units_per_second")]
    pub quota_units_per_second: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            page_size: default_page_size(),
            checkpoint_interval: default_checkpoint_interval(),
            quota_units_per_second: default_quota_units_per_second(),
        }
    }
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_file() -> PathBuf {
    PathBuf::from("token.json")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".gmail-cleaner")
}

fn default_oauth_host() -> String {
    "localhost".to_string()
}

fn default_oauth_port() -> u16 {
    8767
}

fn default_callback_timeout_secs() -> u64 {
    120
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_scopes() -> Vec<String> {
    vec![SCOPE_READONLY.to_string(), SCOPE_MODIFY.to_string()]
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrent_batches() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    500
}

fn default_checkpoint_interval() -> usize {
    5000
}

fn default_quota_units_per_second() -> u32 {
    250
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CleanerError::ConfigError(format!("{} has an invalid value: '{}'", name, value)))
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CleanerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| CleanerError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CleanerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CleanerError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| CleanerError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load the file (if any), then layer process environment overrides on top
    pub async fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path).await?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Recognised names: `WEB_AUTH`, `OAUTH_HOST`, `OAUTH_PORT`,
    /// `OAUTH_EXTERNAL_PORT`, `DATA_DIR`, `CREDENTIALS_FILE`, `TOKEN_FILE`,
    /// `BATCH_SIZE`, `MAX_WORKERS`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEB_AUTH") {
            self.auth.web_auth = parse_flag(&v);
        }
        if let Some(v) = lookup("OAUTH_HOST") {
            self.auth.oauth_host = v;
        }
        if let Some(v) = lookup("OAUTH_PORT") {
            self.auth.oauth_port = parse_env("OAUTH_PORT", &v)?;
        }
        if let Some(v) = lookup("OAUTH_EXTERNAL_PORT") {
            self.auth.oauth_external_port = Some(parse_env("OAUTH_EXTERNAL_PORT", &v)?);
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.auth.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CREDENTIALS_FILE") {
            self.auth.credentials_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOKEN_FILE") {
            self.auth.token_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            self.execution.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_WORKERS") {
            self.execution.max_concurrent_batches = parse_env("MAX_WORKERS", &v)?;
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.auth.data_dir.join(path)
        }
    }

    pub fn token_path(&self) -> PathBuf {
        self.resolve(&self.auth.token_file)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.resolve(&self.auth.credentials_file)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.auth.data_dir.join("tasks.json")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.auth.scopes.is_empty() {
            return Err(CleanerError::ConfigError(
                "auth.scopes must contain at least one scope".to_string(),
            ));
        }
        if self.auth.oauth_host.trim().is_empty() {
            return Err(CleanerError::ConfigError(
                "auth.oauth_host cannot be empty".to_string(),
            ));
        }
        if self.auth.callback_timeout_secs == 0 {
            return Err(CleanerError::ConfigError(
                "auth.callback_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.execution.batch_size == 0 || self.execution.batch_size > MAX_BATCH_SIZE {
            return Err(CleanerError::ConfigError(format!(
                "execution.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if !(1..=10).contains(&self.execution.max_concurrent_batches) {
            return Err(CleanerError::ConfigError(
                "execution.max_concurrent_batches must be between 1 and 10".to_string(),
            ));
        }
        if !(1..=10).contains(&self.execution.max_attempts) {
            return Err(CleanerError::ConfigError(
                "execution.max_attempts must be between 1 and 10".to_string(),
            ));
        }
        if !(1..=500).contains(&self.execution.page_size) {
            return Err(CleanerError::ConfigError(
                "execution.page_size must be between 1 and 500".to_string(),
            ));
        }
        if self.execution.checkpoint_interval == 0 {
            return Err(CleanerError::ConfigError(
                "execution.checkpoint_interval must be greater than 0".to_string(),
            ));
        }
        if self.execution.quota_units_per_second == 0 {
            return Err(CleanerError::ConfigError(
                "execution.quota_units_per_second must be greater than 0".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.auth.oauth_port, 8767);
        assert_eq!(config.auth.oauth_host, "localhost");
        assert_eq!(config.auth.callback_timeout_secs, 120);
        assert!(!config.auth.web_auth);
        assert_eq!(config.auth.scopes.len(), 2);

        assert_eq!(config.execution.batch_size, 100);
        assert_eq!(config.execution.max_concurrent_batches, 4);
        assert_eq!(config.execution.max_attempts, 3);
        assert_eq!(config.execution.retry_base_delay_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_batch_size_bounds() {
        let mut config = Config::default();
        config.execution.batch_size = 0;
        assert!(config.validate().is_err());

        config.execution.batch_size = MAX_BATCH_SIZE + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("execution.batch_size"));

        config.execution.batch_size = MAX_BATCH_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_workers_bounds() {
        let mut config = Config::default();
        config.execution.max_concurrent_batches = 0;
        assert!(config.validate().is_err());
        config.execution.max_concurrent_batches = 11;
        assert!(config.validate().is_err());
        config.execution.max_concurrent_batches = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_scopes() {
        let mut config = Config::default();
        config.auth.scopes.clear();
        assert!(config.validate().unwrap_err().to_string().contains("auth.scopes"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("WEB_AUTH", "yes"),
                ("OAUTH_HOST", "0.0.0.0"),
                ("OAUTH_PORT", "9000"),
                ("OAUTH_EXTERNAL_PORT", "18767"),
                ("BATCH_SIZE", "50"),
                ("MAX_WORKERS", "2"),
                ("DATA_DIR", "/var/lib/cleaner"),
            ]))
            .unwrap();

        assert!(config.auth.web_auth);
        assert_eq!(config.auth.oauth_host, "0.0.0.0");
        assert_eq!(config.auth.oauth_port, 9000);
        assert_eq!(config.auth.oauth_external_port, Some(18767));
        assert_eq!(config.execution.batch_size, 50);
        assert_eq!(config.execution.max_concurrent_batches, 2);
        assert_eq!(config.token_path(), PathBuf::from("/var/lib/cleaner/token.json"));
        assert_eq!(config.journal_path(), PathBuf::from("/var/lib/cleaner/tasks.json"));
    }

    #[test]
    fn test_env_flag_values() {
        for (value, expected) in [("true", true), ("1", true), ("ON", true), ("no", false), ("", false)] {
            let mut config = Config::default();
            config.apply_env(env(&[("WEB_AUTH", value)])).unwrap();
            assert_eq!(config.auth.web_auth, expected, "WEB_AUTH={}", value);
        }
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("OAUTH_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("OAUTH_PORT"));
    }

    #[test]
    fn test_absolute_paths_not_rebased() {
        let mut config = Config::default();
        config.auth.token_file = PathBuf::from("/secrets/token.json");
        assert_eq!(config.token_path(), PathBuf::from("/secrets/token.json"));
        assert_eq!(
            config.credentials_path(),
            PathBuf::from(".gmail-cleaner/credentials.json")
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_load_with_process_env() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::default().save(temp_file.path()).await.unwrap();

        std::env::set_var("BATCH_SIZE", "25");
        let loaded = Config::load_with_env(temp_file.path()).await;
        std::env::remove_var("BATCH_SIZE");

        assert_eq!(loaded.unwrap().execution.batch_size, 25);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_with_process_env_rejects_invalid_result() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::default().save(temp_file.path()).await.unwrap();

        std::env::set_var("MAX_WORKERS", "64");
        let loaded = Config::load_with_env(temp_file.path()).await;
        std::env::remove_var("MAX_WORKERS");

        assert!(loaded.is_err());
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = Config::default();
        config.execution.batch_size = 250;
        config.auth.oauth_external_port = Some(8080);
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.execution.batch_size, 250);
        assert_eq!(loaded.auth.oauth_external_port, Some(8080));
    }

    #[tokio::test]
    async fn test_config_load_nonexistent_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).await.unwrap();
        assert_eq!(config.execution.batch_size, 100);
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(temp_file.path()).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let partial_config = r#"
[auth]
web_auth = true

[execution]
max_concurrent_batches = 8
"#;
        tokio::fs::write(temp_file.path(), partial_config).await.unwrap();

        let config = Config::load(temp_file.path()).await.unwrap();
        assert!(config.auth.web_auth);
        assert_eq!(config.execution.max_concurrent_batches, 8);
        assert_eq!(config.execution.batch_size, 100);
        assert_eq!(config.auth.oauth_port, 8767);
    }

    #[tokio::test]
    async fn test_config_create_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::create_example(&path).await.unwrap();
        assert!(path.exists());
        assert!(Config::load(&path).await.is_ok());
    }
}
