//! Connection configuration
//!
//! A [`ConnectConfig`] bundles everything `SftpClient::connect` needs: the SSH
//! endpoint and credentials, the retry policy for establishing the session and
//! the default batch size for bulk transfers. It is usually loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::retry::RetryConfig;
use super::types::constants::DEFAULT_CONCURRENCY;
use crate::ssh::SshConfig;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(flatten)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Default batch size for bulk transfers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl ConnectConfig {
    pub fn new(ssh: SshConfig) -> Self {
        Self {
            ssh,
            retry: RetryConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;
    use tempfile::tempdir;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config = ConnectConfig::from_json_str(
            r#"{
                "host": "files.example.com",
                "username": "deploy",
                "auth": { "type": "password", "password": "hunter2" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.timeout_secs, 20);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(matches!(config.ssh.auth, AuthMethod::Password { .. }));
    }

    #[test]
    fn test_full_json() {
        let config = ConnectConfig::from_json_str(
            r#"{
                "host": "10.0.0.5",
                "port": 2222,
                "username": "backup",
                "auth": { "type": "key", "key_path": "~/.ssh/id_ed25519" },
                "timeout_secs": 5,
                "retry": { "max_retries": 4, "initial_backoff_ms": 250 },
                "concurrency": 40
            }"#,
        )
        .unwrap();

        assert_eq!(config.ssh.address(), "10.0.0.5:2222");
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.initial_backoff_ms, 250);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
        assert_eq!(config.concurrency, 40);
        match config.ssh.auth {
            AuthMethod::Key { passphrase, .. } => assert!(passphrase.is_none()),
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = ConnectConfig::from_json_str(
            r#"{
                "host": "h",
                "username": "u",
                "auth": { "type": "password", "password": "p" },
                "concurrency": 0
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            ConnectConfig::from_json_str("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sftp.json");
        std::fs::write(
            &path,
            r#"{ "host": "h", "username": "u", "auth": { "type": "password", "password": "p" } }"#,
        )
        .unwrap();

        let config = ConnectConfig::load(&path).await.unwrap();
        assert_eq!(config.ssh.host, "h");

        let missing = ConnectConfig::load(dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
