//! SSH Error types

use thiserror::Error;

use crate::sftp::error::ErrorCode;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Address lookup failed: {0}")]
    AddressLookup(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("No such file: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Failure: {0}")]
    Failure(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Stable code used when this error is formatted
    pub fn code(&self) -> ErrorCode {
        match self {
            SshError::AddressLookup(_) => ErrorCode::AddressLookup,
            SshError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            SshError::ConnectionReset(_) => ErrorCode::ConnectionReset,
            SshError::Timeout(_) => ErrorCode::TimedOut,
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => ErrorCode::BadAuth,
            SshError::NotFound(_) => ErrorCode::NotFound,
            SshError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            SshError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SshError::IoError(e) => ErrorCode::from_io_kind(e.kind()),
            SshError::Disconnected => ErrorCode::NotConnected,
            SshError::Failure(_) | SshError::ChannelError(_) | SshError::ProtocolError(_) => {
                ErrorCode::GenericClient
            }
        }
    }

    /// Whether a connection attempt that failed this way may be retried.
    ///
    /// Only network-level failures qualify; credentials and key problems never do.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::AddressLookup
                | ErrorCode::ConnectionRefused
                | ErrorCode::ConnectionReset
                | ErrorCode::TimedOut
        )
    }

    /// Classify a socket-level error from the TCP connect
    pub fn from_connect_io(err: std::io::Error, addr: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => SshError::ConnectionRefused(addr.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                SshError::ConnectionReset(addr.to_string())
            }
            ErrorKind::TimedOut => SshError::Timeout(format!("{}: {}", addr, err)),
            _ => SshError::IoError(err),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::IoError(e),
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
