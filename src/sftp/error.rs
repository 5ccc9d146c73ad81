//! SFTP error formatting
//!
//! Every failure that leaves a public operation is an [`SftpError`]: a message
//! prefixed with the name of the operation that produced it, a stable
//! [`ErrorCode`] for programmatic matching, and (for connection attempts) the
//! number of attempts made. Wrapping an already formatted error chains the
//! operation names with `->`, outermost first.

use std::fmt;

use thiserror::Error;

use crate::ssh::SshError;

/// Context name used when the caller does not supply one.
pub const DEFAULT_CONTEXT: &str = "sftp";

/// Stable error codes carried by [`SftpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    GenericClient,
    NotConnected,
    BadPath,
    BadAuth,
    PermissionDenied,
    NotFound,
    NotDirectory,
    AlreadyExists,
    AddressLookup,
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    UnexpectedTermination,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GenericClient => "ERR_GENERIC_CLIENT",
            ErrorCode::NotConnected => "ERR_NOT_CONNECTED",
            ErrorCode::BadPath => "ERR_BAD_PATH",
            ErrorCode::BadAuth => "ERR_BAD_AUTH",
            ErrorCode::PermissionDenied => "EACCES",
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::NotDirectory => "ENOTDIR",
            ErrorCode::AlreadyExists => "EEXIST",
            ErrorCode::AddressLookup => "ENOTFOUND",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::UnexpectedTermination => "ERR_UNEXPECTED_TERMINATION",
        }
    }

    /// Map a local I/O error kind onto the closest code
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ErrorCode::ConnectionReset
            }
            ErrorKind::TimedOut => ErrorCode::TimedOut,
            _ => ErrorCode::GenericClient,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted without an open session
    NoConnection,
    /// Source missing, wrong object kind, or destination kind conflict
    BadPath,
    /// Address lookup, refused or reset connection, timeout
    TransientTransport,
    PermissionDenied,
    /// End/close observed outside an expected shutdown
    UnexpectedTermination,
    GenericClient,
}

/// Formatted error returned by every public operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SftpError {
    pub message: String,
    pub code: ErrorCode,
    /// True when this error wraps a previously formatted error
    pub custom: bool,
    /// Number of connection attempts made, for connect failures
    pub retry_count: Option<u32>,
}

impl SftpError {
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            ErrorCode::NotConnected => ErrorKind::NoConnection,
            ErrorCode::BadPath | ErrorCode::NotFound | ErrorCode::NotDirectory => {
                ErrorKind::BadPath
            }
            ErrorCode::AddressLookup
            | ErrorCode::ConnectionRefused
            | ErrorCode::ConnectionReset
            | ErrorCode::TimedOut => ErrorKind::TransientTransport,
            ErrorCode::PermissionDenied => ErrorKind::PermissionDenied,
            ErrorCode::UnexpectedTermination => ErrorKind::UnexpectedTermination,
            ErrorCode::GenericClient
            | ErrorCode::BadAuth
            | ErrorCode::AlreadyExists => ErrorKind::GenericClient,
        }
    }

    /// `"<name>: Bad path: <detail>"` with [`ErrorCode::BadPath`]
    pub fn bad_path(name: &str, detail: impl fmt::Display) -> Self {
        fmt_error(format!("Bad path: {}", detail), name, Some(ErrorCode::BadPath), None)
    }

    /// `"<name>: No SFTP connection available"` with [`ErrorCode::NotConnected`]
    pub fn no_connection(name: &str) -> Self {
        fmt_error(
            "No SFTP connection available",
            name,
            Some(ErrorCode::NotConnected),
            None,
        )
    }
}

/// Anything [`fmt_error`] knows how to format
#[derive(Debug)]
pub enum ErrorSource {
    /// No error value at all
    Undefined,
    /// A bare message
    Message(String),
    /// A transport or filesystem error with a known code
    Transport { code: ErrorCode, message: String },
    /// An error that already went through [`fmt_error`]
    Formatted(SftpError),
}

impl From<&str> for ErrorSource {
    fn from(msg: &str) -> Self {
        ErrorSource::Message(msg.to_string())
    }
}

impl From<String> for ErrorSource {
    fn from(msg: String) -> Self {
        ErrorSource::Message(msg)
    }
}

impl From<&SshError> for ErrorSource {
    fn from(err: &SshError) -> Self {
        ErrorSource::Transport {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<SshError> for ErrorSource {
    fn from(err: SshError) -> Self {
        ErrorSource::from(&err)
    }
}

impl From<std::io::Error> for ErrorSource {
    fn from(err: std::io::Error) -> Self {
        ErrorSource::Transport {
            code: ErrorCode::from_io_kind(err.kind()),
            message: err.to_string(),
        }
    }
}

impl From<SftpError> for ErrorSource {
    fn from(err: SftpError) -> Self {
        ErrorSource::Formatted(err)
    }
}

impl<T: Into<ErrorSource>> From<Option<T>> for ErrorSource {
    fn from(err: Option<T>) -> Self {
        err.map(Into::into).unwrap_or(ErrorSource::Undefined)
    }
}

fn retry_suffix(retry_count: Option<u32>) -> String {
    match retry_count {
        Some(1) => " after 1 attempt".to_string(),
        Some(n) => format!(" after {} attempts", n),
        None => String::new(),
    }
}

/// Build a uniform [`SftpError`] from any supported error source.
///
/// * `name` - calling-context name prefixed to the message; an empty name
///   falls back to [`DEFAULT_CONTEXT`]
/// * `code` - code to use when the source carries none (or, for an already
///   formatted source, an override)
/// * `retry_count` - attempts made, appended to the message when present
pub fn fmt_error(
    err: impl Into<ErrorSource>,
    name: &str,
    code: Option<ErrorCode>,
    retry_count: Option<u32>,
) -> SftpError {
    let name = if name.is_empty() { DEFAULT_CONTEXT } else { name };
    let retry = retry_suffix(retry_count);
    match err.into() {
        ErrorSource::Undefined => SftpError {
            message: format!("{}: Undefined error - probably a bug!", name),
            code: code.unwrap_or(ErrorCode::GenericClient),
            custom: false,
            retry_count,
        },
        ErrorSource::Message(msg) => SftpError {
            message: format!("{}: {}{}", name, msg, retry),
            code: code.unwrap_or(ErrorCode::GenericClient),
            custom: false,
            retry_count,
        },
        ErrorSource::Formatted(inner) => SftpError {
            message: format!("{}->{}{}", name, inner.message, retry),
            code: code.unwrap_or(inner.code),
            custom: true,
            retry_count: retry_count.or(inner.retry_count),
        },
        ErrorSource::Transport {
            code: source_code,
            message,
        } => {
            let message = match source_code {
                ErrorCode::AddressLookup => {
                    format!("{}: Address lookup failed for host{}", name, retry)
                }
                ErrorCode::ConnectionRefused => {
                    format!("{}: Remote host refused connection{}", name, retry)
                }
                ErrorCode::ConnectionReset => {
                    format!("{}: Remote host has reset the connection{}", name, retry)
                }
                _ => format!("{}: {}{}", name, message, retry),
            };
            let code = match (source_code, code) {
                (ErrorCode::GenericClient, Some(fallback)) => fallback,
                (source_code, _) => source_code,
            };
            SftpError {
                message,
                code,
                custom: false,
                retry_count,
            }
        }
    }
}
