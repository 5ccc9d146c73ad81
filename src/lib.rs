//! oxide-sftp - client-side SFTP engine
//!
//! Built on russh and russh-sftp. Every remote operation runs under a
//! connection guard that turns remote disconnects into operation errors, and
//! directory trees are moved in bounded concurrent batches.
//!
//! ```no_run
//! use oxide_sftp::{ConnectConfig, SftpClient, SshConfig, TransferOptions};
//!
//! # async fn demo() -> Result<(), oxide_sftp::SftpError> {
//! let client = SftpClient::default();
//! let config = ConnectConfig::new(SshConfig::with_password("files.example.com", 22, "deploy", "secret"));
//! client.connect(&config).await?;
//! client.upload_dir("./site", "/var/www/site", TransferOptions::default()).await?;
//! client.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod sftp;
pub mod ssh;

pub use sftp::{
    fmt_error, ConfigError, ConnectConfig, ErrorCode, ErrorKind, FastTransferOptions, FileInfo,
    FileType, RetryConfig, Session, SftpClient, SftpError, Transform, TransferFilter,
    TransferOptions,
};
pub use ssh::{AuthMethod, SshConfig, SshError, SshTransport};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` takes precedence over `default_directive`. Calling this more
/// than once is harmless.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
