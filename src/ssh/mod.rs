//! SSH module - SSH connections backing the SFTP engine
//!
//! This module provides the russh transport used by `SftpClient` by default.
//!
//! # Features
//! - Password and private key authentication
//! - Keepalive on the underlying SSH connection
//! - Disconnect notification through the connection's event hub

mod client;
mod config;
mod error;

pub use client::{ClientHandler, SshConnection, SshTransport};
pub use config::{expand_home, AuthMethod, SshConfig};
pub use error::SshError;
