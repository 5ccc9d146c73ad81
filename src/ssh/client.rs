//! SSH transport implementation using russh
//!
//! [`SshTransport`] opens a TCP connection, completes the SSH handshake,
//! authenticates and starts the `sftp` subsystem. The resulting
//! [`SshConnection`] maps each engine primitive onto one russh-sftp call and
//! forwards disconnects to its event hub.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{expand_home, AuthMethod, SshConfig};
use super::error::SshError;
use crate::sftp::backend::{Connection, RemoteReader, RemoteWriter, Transport};
use crate::sftp::events::{ConnectionEvent, EventHub};
use crate::sftp::path_utils::{join_remote_path, remote_file_name};
use crate::sftp::types::{FileInfo, FileType, WriteMode};

/// Transport over real SSH connections
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

impl SshTransport {
    async fn authenticate(
        handle: &mut client::Handle<ClientHandler>,
        config: &SshConfig,
    ) -> Result<(), SshError> {
        let authenticated = match &config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(expand_home(key_path), passphrase.as_deref())?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn Connection>, SshError> {
        let addr = config.address();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::AddressLookup(format!("{}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| SshError::AddressLookup(config.host.clone()))?;

        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| SshError::from_connect_io(e, &addr))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let events = Arc::new(EventHub::new());
        let handler = ClientHandler::new(config.host.clone(), config.port, events.clone());
        let mut handle = client::connect_stream(Arc::new(ssh_config), stream, handler).await?;
        debug!("SSH handshake completed");

        Self::authenticate(&mut handle, config).await?;
        info!("SSH authentication successful");

        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SshError::ChannelError(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        info!("SFTP subsystem opened on {}", addr);

        Ok(Arc::new(SshConnection {
            handle: Mutex::new(Some(handle)),
            sftp,
            events,
        }))
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    events: Arc<EventHub>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, events: Arc<EventHub>) -> Self {
        Self { host, port, events }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{}: {}",
            self.host,
            self.port,
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(_) => {
                info!("{}:{} ended the session", self.host, self.port);
                self.events.emit(ConnectionEvent::End);
            }
            client::DisconnectReason::Error(e) => {
                warn!("Connection to {}:{} failed: {}", self.host, self.port, e);
                self.events.emit(ConnectionEvent::Error(e));
            }
        }
        self.events.emit(ConnectionEvent::Close);
        Ok(())
    }
}

/// One SFTP subsystem over an authenticated SSH connection
pub struct SshConnection {
    handle: Mutex<Option<client::Handle<ClientHandler>>>,
    sftp: SftpSession,
    events: Arc<EventHub>,
}

/// Map SFTP errors onto transport errors
fn map_sftp_error(err: SftpErrorInner, path: &str) -> SshError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SshError::NotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SshError::PermissionDenied(path.to_string())
    } else if err_str.contains("exists") {
        SshError::AlreadyExists(path.to_string())
    } else {
        SshError::Failure(format!("{}: {}", path, err_str))
    }
}

fn file_info(path: String, name: String, metadata: &FileAttributes) -> FileInfo {
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_symlink() {
        FileType::Symlink
    } else if metadata.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    FileInfo {
        name,
        path,
        file_type,
        size: metadata.size.unwrap_or(0),
        modified: metadata.mtime.map(u64::from).unwrap_or(0),
        accessed: metadata.atime.map(u64::from).unwrap_or(0),
        permissions: metadata.permissions.map(|p| p & 0o7777).unwrap_or(0),
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    async fn real_path(&self, path: &str) -> Result<String, SshError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SshError> {
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let name = remote_file_name(path).to_string();
        Ok(file_info(path.to_string(), name, &metadata))
    }

    async fn link_stat(&self, path: &str) -> Result<FileInfo, SshError> {
        let metadata = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let name = remote_file_name(path).to_string();
        Ok(file_info(path.to_string(), name, &metadata))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SshError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote_path(path, &name);
            entries.push(file_info(full_path, name, &entry.metadata()));
        }
        Ok(entries)
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteWriter, SshError> {
        let flags = match mode {
            WriteMode::Truncate => OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            WriteMode::Append => OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::APPEND,
        };
        let file = self
            .sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SshError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn write_range(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), SshError> {
        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::WRITE)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SshError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SshError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<(), SshError> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn close(&self) -> Result<(), SshError> {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP subsystem close: {}", e);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await?;
        }
        Ok(())
    }
}
