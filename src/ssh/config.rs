//! SSH Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Time allowed for TCP connect, handshake and authentication, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file (`~/` is expanded)
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl SshConfig {
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::Password {
                password: password.into(),
            },
            timeout_secs: default_timeout(),
        }
    }

    /// `host:port` as used for socket addressing and log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Expand a leading `~/` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SshConfig = serde_json::from_str(
            r#"{
                "host": "files.example.com",
                "username": "deploy",
                "auth": { "type": "key", "key_path": "~/.ssh/id_ed25519", "passphrase": null }
            }"#,
        )
        .unwrap();

        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 20);
        assert_eq!(config.address(), "files.example.com:22");
        match config.auth {
            AuthMethod::Key { key_path, passphrase } => {
                assert_eq!(key_path, "~/.ssh/id_ed25519");
                assert!(passphrase.is_none());
            }
            other => panic!("unexpected auth method: {:?}", other),
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/key"), PathBuf::from("/etc/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.ssh/id_rsa"), home.join(".ssh/id_rsa"));
        }
    }
}
