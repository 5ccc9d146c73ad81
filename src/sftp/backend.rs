//! Single-object primitives the engine is built on
//!
//! A [`Transport`] opens connections; a [`Connection`] performs one remote
//! operation per call and reports its lifecycle through an [`EventHub`].
//! The russh-backed implementation lives in [`crate::ssh`], an in-process one
//! in [`super::memory`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::events::EventHub;
use super::types::{FileInfo, WriteMode};
use crate::ssh::{SshConfig, SshError};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish one connection (network, handshake, authentication)
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn Connection>, SshError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Lifecycle events of this connection
    fn events(&self) -> &Arc<EventHub>;

    /// Resolve `path` on the server (`.` yields the login directory)
    async fn real_path(&self, path: &str) -> Result<String, SshError>;

    /// Attributes of `path`, following symlinks
    async fn stat(&self, path: &str) -> Result<FileInfo, SshError>;

    /// Attributes of `path` itself; a symlink reports as [`FileType::Symlink`]
    ///
    /// [`FileType::Symlink`]: super::types::FileType::Symlink
    async fn link_stat(&self, path: &str) -> Result<FileInfo, SshError>;

    /// List a directory, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SshError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError>;

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteWriter, SshError>;

    /// Read up to `len` bytes starting at `offset`
    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SshError>;

    /// Write `data` at `offset` into an existing file
    async fn write_range(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SshError>;

    async fn create_dir(&self, path: &str) -> Result<(), SshError>;

    async fn remove_dir(&self, path: &str) -> Result<(), SshError>;

    async fn remove_file(&self, path: &str) -> Result<(), SshError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError>;

    async fn set_mode(&self, path: &str, mode: u32) -> Result<(), SshError>;

    /// Shut the connection down
    async fn close(&self) -> Result<(), SshError>;
}
