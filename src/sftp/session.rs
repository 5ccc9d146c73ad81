//! SFTP Session management
//!
//! An [`SftpClient`] owns at most one open [`Session`]. Every public
//! operation checks for the session, then runs inside a connection guard,
//! including the lookup of the remote working directory its relative paths
//! resolve against. The unguarded primitives on [`Session`] are what the
//! bulk operations compose.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::backend::{Connection, Transport};
use super::config::ConnectConfig;
use super::error::{fmt_error, ErrorCode, SftpError};
use super::events::{ConnectionEvent, EventHub, EventKind, Listener, ListenerId};
use super::guard::{guarded, have_connection, OpState};
use super::path_utils::{is_absolute_remote_path, join_remote_path, normalize_separators, resolve_remote_path};
use super::retry::retry_connect;
use super::transfer::{check_batch_size, run_batched, Task};
use super::types::constants::{DEFAULT_CONCURRENCY, STREAM_BUFFER_SIZE};
use super::types::{FastTransferOptions, FileInfo, FileType, TransferFilter, WriteMode};
use super::walker::{walk, RemoteTree};
use crate::ssh::{SshError, SshTransport};

/// Copy `reader` into `writer` through a fixed buffer, then shut the writer
/// down so the remote handle is closed.
pub(crate) async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut transferred = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        transferred += n as u64;
    }
    writer.shutdown().await?;
    Ok(transferred)
}

/// [`pipe`] with every chunk rewritten by `map` on its way to `writer`.
/// Returns the number of bytes written.
pub(crate) async fn pipe_mapped<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    mut map: F,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(&[u8]) -> Vec<u8>,
{
    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        let chunk = map(&buffer[..n]);
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.shutdown().await?;
    Ok(written)
}

/// `(offset, len)` of each chunk of a `size`-byte file
fn chunk_ranges(size: u64, chunk_size: usize) -> Vec<(u64, usize)> {
    let step = chunk_size as u64;
    (0..size.div_ceil(step))
        .map(|i| {
            let offset = i * step;
            (offset, (size - offset).min(step) as usize)
        })
        .collect()
}

fn check_fast_options(options: &FastTransferOptions, name: &str) -> Result<(), SftpError> {
    if options.chunk_size == 0 {
        return Err(fmt_error(
            "Chunk size must be a positive integer, got 0",
            name,
            Some(ErrorCode::GenericClient),
            None,
        ));
    }
    Ok(())
}

fn lifecycle_listener(open: Arc<AtomicBool>) -> Listener {
    Arc::new(move |event| {
        match event {
            ConnectionEvent::Error(e) => warn!("SFTP connection error: {}", e),
            ConnectionEvent::End | ConnectionEvent::Close => {
                if open.swap(false, Ordering::SeqCst) {
                    info!("SFTP connection closed by remote ({:?})", event.kind());
                }
            }
        }
        Ok(())
    })
}

/// One live connection
pub struct Session {
    conn: Arc<dyn Connection>,
    open: Arc<AtomicBool>,
    cwd: OnceCell<String>,
    lifecycle: [ListenerId; 3],
}

impl Session {
    /// Wrap a fresh connection. Lifecycle listeners stay attached for the
    /// session's lifetime and mark it closed on any end or close.
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        let open = Arc::new(AtomicBool::new(true));
        let hub = conn.events();
        let lifecycle = [
            hub.on(EventKind::End, lifecycle_listener(open.clone())),
            hub.on(EventKind::Close, lifecycle_listener(open.clone())),
            hub.on(EventKind::Error, lifecycle_listener(open.clone())),
        ];
        Self {
            conn,
            open,
            cwd: OnceCell::new(),
            lifecycle,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn events(&self) -> &Arc<EventHub> {
        self.conn.events()
    }

    fn detach(&self) {
        self.open.store(false, Ordering::SeqCst);
        for id in self.lifecycle {
            self.events().off(id);
        }
    }

    /// Run `op` as the guarded operation `name`
    pub async fn guarded<T, F>(&self, name: &str, op: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        guarded(self.events(), name, OpState::new(), op).await
    }

    /// Remote working directory, fetched once per session
    pub async fn cwd(&self) -> Result<String, SftpError> {
        self.cwd
            .get_or_try_init(|| async {
                self.conn
                    .real_path(".")
                    .await
                    .map_err(|e| fmt_error(e, "cwd", None, None))
            })
            .await
            .cloned()
    }

    /// Canonical form of `path`: absolute paths as given (separators
    /// normalized), everything else resolved against the working directory.
    pub async fn resolve(&self, path: &str, name: &str) -> Result<String, SftpError> {
        if !self.is_open() {
            return Err(SftpError::no_connection(name));
        }
        let path = normalize_separators(path);
        if is_absolute_remote_path(&path) {
            return Ok(path);
        }
        let cwd = self
            .cwd()
            .await
            .map_err(|e| fmt_error(e, name, None, None))?;
        Ok(resolve_remote_path(&cwd, &path))
    }

    // Primitives below take resolved remote paths and run unguarded.

    pub async fn real_path(&self, path: &str) -> Result<String, SftpError> {
        self.conn
            .real_path(path)
            .await
            .map_err(|e| fmt_error(e, "real_path", None, None))
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.conn
            .stat(path)
            .await
            .map_err(|e| fmt_error(e, "stat", None, None))
    }

    async fn entry_type(&self, path: &str, name: &str) -> Result<Option<FileType>, SftpError> {
        match self.conn.stat(path).await {
            Ok(info) => Ok(Some(info.file_type)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(fmt_error(e, name, None, None)),
        }
    }

    async fn link_type(&self, path: &str, name: &str) -> Result<Option<FileType>, SftpError> {
        match self.conn.link_stat(path).await {
            Ok(info) => Ok(Some(info.file_type)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(fmt_error(e, name, None, None)),
        }
    }

    /// Type of the object at `path`, or `None` when there is none
    pub async fn exists(&self, path: &str) -> Result<Option<FileType>, SftpError> {
        self.entry_type(path, "exists").await
    }

    /// Directory entries in name order, optionally filtered
    pub async fn list(
        &self,
        path: &str,
        filter: Option<&TransferFilter>,
    ) -> Result<Vec<FileInfo>, SftpError> {
        let mut entries = self
            .conn
            .read_dir(path)
            .await
            .map_err(|e| fmt_error(e, "list", None, None))?;
        if let Some(filter) = filter {
            entries.retain(|e| filter.accepts(&e.path, e.file_type.is_dir()));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    pub async fn get(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        let mut reader = self
            .conn
            .open_read(remote)
            .await
            .map_err(|e| fmt_error(e, "get", None, None))?;
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| fmt_error(e, "get", None, None))?;
        let transferred = pipe(&mut reader, &mut file)
            .await
            .map_err(|e| fmt_error(e, "get", None, None))?;
        debug!("Downloaded {} ({} bytes) to {}", remote, transferred, local.display());
        Ok(transferred)
    }

    pub async fn put(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        let mut writer = self
            .conn
            .open_write(remote, WriteMode::Truncate)
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        let transferred = pipe(&mut file, &mut writer)
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        debug!("Uploaded {} ({} bytes) to {}", local.display(), transferred, remote);
        Ok(transferred)
    }

    pub async fn get_buffer(&self, remote: &str) -> Result<Vec<u8>, SftpError> {
        let mut reader = self
            .conn
            .open_read(remote)
            .await
            .map_err(|e| fmt_error(e, "get", None, None))?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| fmt_error(e, "get", None, None))?;
        Ok(data)
    }

    pub async fn put_buffer(
        &self,
        data: &[u8],
        remote: &str,
        mode: WriteMode,
    ) -> Result<u64, SftpError> {
        let mut writer = self
            .conn
            .open_write(remote, mode)
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        writer
            .shutdown()
            .await
            .map_err(|e| fmt_error(e, "put", None, None))?;
        Ok(data.len() as u64)
    }

    /// Download in parallel chunks over ranged reads
    pub async fn fast_get(
        &self,
        remote: &str,
        local: &Path,
        options: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        const NAME: &str = "fast_get";
        check_fast_options(&options, NAME)?;
        let size = self
            .conn
            .stat(remote)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?
            .size;

        let file = tokio::fs::File::create(local)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?;
        file.set_len(size)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?;
        drop(file);

        let tasks: Vec<Task<'_, u64>> = chunk_ranges(size, options.chunk_size)
            .into_iter()
            .map(|(offset, len)| {
                async move {
                    let chunk = self
                        .conn
                        .read_range(remote, offset, len)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    let mut file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .open(local)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    file.flush()
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    Ok(chunk.len() as u64)
                }
                .boxed()
            })
            .collect();

        let transferred: u64 = run_batched(tasks, options.concurrency).await?.into_iter().sum();
        debug!("Fast download of {} finished: {} bytes", remote, transferred);
        Ok(transferred)
    }

    /// Upload in parallel chunks over ranged writes
    pub async fn fast_put(
        &self,
        local: &Path,
        remote: &str,
        options: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        const NAME: &str = "fast_put";
        check_fast_options(&options, NAME)?;
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?
            .len();

        // Create or truncate the target before the ranged writes
        let mut writer = self
            .conn
            .open_write(remote, WriteMode::Truncate)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?;
        writer
            .shutdown()
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))?;
        drop(writer);

        let tasks: Vec<Task<'_, u64>> = chunk_ranges(size, options.chunk_size)
            .into_iter()
            .map(|(offset, len)| {
                async move {
                    let mut file = tokio::fs::File::open(local)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    let mut chunk = vec![0u8; len];
                    file.read_exact(&mut chunk)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    self.conn
                        .write_range(remote, offset, &chunk)
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                    Ok(len as u64)
                }
                .boxed()
            })
            .collect();

        let transferred: u64 = run_batched(tasks, options.concurrency).await?.into_iter().sum();
        debug!("Fast upload to {} finished: {} bytes", remote, transferred);
        Ok(transferred)
    }

    /// Create `path`; with `recursive`, every missing ancestor as well
    pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SftpError> {
        if !recursive {
            return self
                .conn
                .create_dir(path)
                .await
                .map_err(|e| fmt_error(e, "mkdir", None, None));
        }

        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_remote_path(&current, part);
            match self.entry_type(&current, "mkdir").await? {
                Some(FileType::Directory) => {}
                Some(_) => {
                    return Err(SftpError::bad_path(
                        "mkdir",
                        format!("{} exists and is not a directory", current),
                    ))
                }
                None => self
                    .conn
                    .create_dir(&current)
                    .await
                    .map_err(|e| fmt_error(e, "mkdir", None, None))?,
            }
        }
        Ok(())
    }

    /// Remove directory `path`; with `recursive`, its contents first.
    ///
    /// Symlinks inside the tree are unlinked, never followed, and a `path`
    /// that is itself a symlink is refused.
    pub async fn rmdir(
        &self,
        path: &str,
        recursive: bool,
        concurrency: usize,
    ) -> Result<(), SftpError> {
        const NAME: &str = "rmdir";
        check_batch_size(concurrency, NAME)?;
        match self.link_type(path, NAME).await? {
            None => return Err(SftpError::bad_path(NAME, format!("{} does not exist", path))),
            Some(t) if !t.is_dir() => {
                return Err(SftpError::bad_path(NAME, format!("{} is not a directory", path)))
            }
            Some(_) => {}
        }

        if recursive {
            let descriptors = walk(&RemoteTree::new(self.conn.clone()), path, None)
                .await
                .map_err(|e| fmt_error(e, NAME, None, None))?;
            // Links go with the files: removing one never touches its target
            let (dirs, files): (Vec<_>, Vec<_>) =
                descriptors.into_iter().partition(|d| d.is_dir());

            let tasks: Vec<Task<'_, ()>> = files
                .into_iter()
                .map(|d| {
                    let target = join_remote_path(path, &d.relative_path);
                    async move {
                        self.conn
                            .remove_file(&target)
                            .await
                            .map_err(|e| fmt_error(e, NAME, None, None))
                    }
                    .boxed()
                })
                .collect();
            run_batched(tasks, concurrency).await?;

            // Reverse pre-order puts every directory after its children
            for d in dirs.iter().rev() {
                self.conn
                    .remove_dir(&join_remote_path(path, &d.relative_path))
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
            }
        }

        self.conn
            .remove_dir(path)
            .await
            .map_err(|e| fmt_error(e, NAME, None, None))
    }

    /// Remove a file; a missing file is success when `not_found_ok`
    pub async fn delete(&self, path: &str, not_found_ok: bool) -> Result<(), SftpError> {
        match self.conn.remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if not_found_ok && e.code() == ErrorCode::NotFound => {
                debug!("delete: {} already absent", path);
                Ok(())
            }
            Err(e) => Err(fmt_error(e, "delete", None, None)),
        }
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.conn
            .rename(from, to)
            .await
            .map_err(|e| fmt_error(e, "rename", None, None))
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        self.conn
            .set_mode(path, mode)
            .await
            .map_err(|e| fmt_error(e, "chmod", None, None))
    }
}

/// Client-side SFTP engine over a single connection
pub struct SftpClient {
    transport: Arc<dyn Transport>,
    connecting: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
    concurrency: AtomicUsize,
}

impl Default for SftpClient {
    fn default() -> Self {
        Self::new(Arc::new(SshTransport))
    }
}

impl SftpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connecting: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
            concurrency: AtomicUsize::new(DEFAULT_CONCURRENCY),
        }
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_open())
    }

    /// Batch size used when an operation does not specify one
    pub fn default_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// The open session, or the "No SFTP connection" failure for `name`
    pub(crate) fn active(&self, name: &str) -> Result<Arc<Session>, SftpError> {
        let session = self.session();
        have_connection(session.as_deref(), name, None)?;
        session.ok_or_else(|| SftpError::no_connection(name))
    }

    /// Open the session, retrying transient network failures
    pub async fn connect(&self, config: &ConnectConfig) -> Result<(), SftpError> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Err(fmt_error(
                "An existing SFTP connection is already defined",
                "connect",
                Some(ErrorCode::GenericClient),
                None,
            ));
        }

        let concurrency = check_batch_size(config.concurrency, "connect")?;
        let transport = &self.transport;
        let ssh = &config.ssh;
        let timeout = Duration::from_secs(ssh.timeout_secs);
        info!("Connecting to {}", ssh.address());

        let conn = retry_connect(
            || async move {
                match tokio::time::timeout(timeout, transport.open(ssh)).await {
                    Ok(result) => result,
                    Err(_) => Err(SshError::Timeout(format!(
                        "No session with {} within {}s",
                        ssh.address(),
                        ssh.timeout_secs
                    ))),
                }
            },
            &config.retry,
            "connect",
        )
        .await?;

        self.concurrency.store(concurrency, Ordering::SeqCst);
        *self.session.write() = Some(Arc::new(Session::new(conn)));
        info!("SFTP session established with {}", ssh.address());
        Ok(())
    }

    /// Close the session. The end and close events this causes are expected.
    pub async fn end(&self) -> Result<(), SftpError> {
        let session = self.active("end")?;
        let result = guarded(session.events(), "end", OpState::ending(), async {
            session
                .connection()
                .close()
                .await
                .map_err(|e| fmt_error(e, "end", None, None))
        })
        .await;

        session.detach();
        let mut slot = self.session.write();
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
            *slot = None;
        }
        info!("SFTP session ended");
        result
    }

    pub async fn cwd(&self) -> Result<String, SftpError> {
        let session = self.active("cwd")?;
        session.guarded("cwd", session.cwd()).await
    }

    pub async fn real_path(&self, remote_path: &str) -> Result<String, SftpError> {
        let session = self.active("real_path")?;
        session
            .guarded("real_path", async {
                let path = session.resolve(remote_path, "real_path").await?;
                session.real_path(&path).await
            })
            .await
    }

    pub async fn exists(&self, remote_path: &str) -> Result<Option<FileType>, SftpError> {
        let session = self.active("exists")?;
        session
            .guarded("exists", async {
                let path = session.resolve(remote_path, "exists").await?;
                session.exists(&path).await
            })
            .await
    }

    pub async fn stat(&self, remote_path: &str) -> Result<FileInfo, SftpError> {
        let session = self.active("stat")?;
        session
            .guarded("stat", async {
                let path = session.resolve(remote_path, "stat").await?;
                session.stat(&path).await
            })
            .await
    }

    pub async fn list(
        &self,
        remote_path: &str,
        filter: Option<&TransferFilter>,
    ) -> Result<Vec<FileInfo>, SftpError> {
        let session = self.active("list")?;
        session
            .guarded("list", async {
                let path = session.resolve(remote_path, "list").await?;
                session.list(&path, filter).await
            })
            .await
    }

    /// Download one file; returns the bytes transferred
    pub async fn get(&self, remote_path: &str, local_path: impl AsRef<Path>) -> Result<u64, SftpError> {
        let session = self.active("get")?;
        session
            .guarded("get", async {
                let path = session.resolve(remote_path, "get").await?;
                session.get(&path, local_path.as_ref()).await
            })
            .await
    }

    /// Upload one file, replacing any existing remote file
    pub async fn put(&self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<u64, SftpError> {
        let session = self.active("put")?;
        session
            .guarded("put", async {
                let path = session.resolve(remote_path, "put").await?;
                session.put(local_path.as_ref(), &path).await
            })
            .await
    }

    pub async fn get_buffer(&self, remote_path: &str) -> Result<Vec<u8>, SftpError> {
        let session = self.active("get")?;
        session
            .guarded("get", async {
                let path = session.resolve(remote_path, "get").await?;
                session.get_buffer(&path).await
            })
            .await
    }

    pub async fn put_buffer(&self, data: &[u8], remote_path: &str) -> Result<u64, SftpError> {
        let session = self.active("put")?;
        session
            .guarded("put", async {
                let path = session.resolve(remote_path, "put").await?;
                session.put_buffer(data, &path, WriteMode::Truncate).await
            })
            .await
    }

    pub async fn append(&self, data: &[u8], remote_path: &str) -> Result<u64, SftpError> {
        let session = self.active("append")?;
        session
            .guarded("append", async {
                let path = session.resolve(remote_path, "append").await?;
                session.put_buffer(data, &path, WriteMode::Append).await
            })
            .await
    }

    pub async fn fast_get(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
        options: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        let session = self.active("fast_get")?;
        session
            .guarded("fast_get", async {
                let path = session.resolve(remote_path, "fast_get").await?;
                session.fast_get(&path, local_path.as_ref(), options).await
            })
            .await
    }

    pub async fn fast_put(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        options: FastTransferOptions,
    ) -> Result<u64, SftpError> {
        let session = self.active("fast_put")?;
        session
            .guarded("fast_put", async {
                let path = session.resolve(remote_path, "fast_put").await?;
                session.fast_put(local_path.as_ref(), &path, options).await
            })
            .await
    }

    pub async fn mkdir(&self, remote_path: &str, recursive: bool) -> Result<(), SftpError> {
        let session = self.active("mkdir")?;
        session
            .guarded("mkdir", async {
                let path = session.resolve(remote_path, "mkdir").await?;
                session.mkdir(&path, recursive).await
            })
            .await
    }

    pub async fn rmdir(&self, remote_path: &str, recursive: bool) -> Result<(), SftpError> {
        let session = self.active("rmdir")?;
        let concurrency = check_batch_size(self.default_concurrency(), "rmdir")?;
        session
            .guarded("rmdir", async {
                let path = session.resolve(remote_path, "rmdir").await?;
                session.rmdir(&path, recursive, concurrency).await
            })
            .await
    }

    pub async fn delete(&self, remote_path: &str, not_found_ok: bool) -> Result<(), SftpError> {
        let session = self.active("delete")?;
        session
            .guarded("delete", async {
                let path = session.resolve(remote_path, "delete").await?;
                session.delete(&path, not_found_ok).await
            })
            .await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let session = self.active("rename")?;
        session
            .guarded("rename", async {
                let from = session.resolve(from, "rename").await?;
                let to = session.resolve(to, "rename").await?;
                session.rename(&from, &to).await
            })
            .await
    }

    pub async fn chmod(&self, remote_path: &str, mode: u32) -> Result<(), SftpError> {
        let session = self.active("chmod")?;
        session
            .guarded("chmod", async {
                let path = session.resolve(remote_path, "chmod").await?;
                session.chmod(&path, mode).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::error::ErrorKind;
    use crate::sftp::memory::{ConnectFault, MemoryTransport, PathFault};
    use crate::sftp::retry::RetryConfig;
    use crate::ssh::SshConfig;
    use tempfile::tempdir;

    fn config() -> ConnectConfig {
        ConnectConfig::new(SshConfig::with_password("memory", 22, "user", "pw"))
            .with_retry(RetryConfig::new(2).with_backoff(1, 2.0, 5))
    }

    async fn connected() -> (Arc<MemoryTransport>, SftpClient) {
        let transport = Arc::new(MemoryTransport::new());
        let client = SftpClient::new(transport.clone());
        client.connect(&config()).await.unwrap();
        (transport, client)
    }

    fn listener_counts(client: &SftpClient) -> (usize, usize, usize) {
        let session = client.session().unwrap();
        let hub = session.events();
        (
            hub.listener_count(EventKind::End),
            hub.listener_count(EventKind::Close),
            hub.listener_count(EventKind::Error),
        )
    }

    #[test]
    fn test_chunk_ranges() {
        assert!(chunk_ranges(0, 4).is_empty());
        assert_eq!(chunk_ranges(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(chunk_ranges(8, 4), vec![(0, 4), (4, 4)]);
    }

    #[tokio::test]
    async fn test_operations_without_session_fail() {
        let client = SftpClient::new(Arc::new(MemoryTransport::new()));

        let err = client.stat("/tmp").await.unwrap_err();
        assert_eq!(err.message, "stat: No SFTP connection available");
        assert_eq!(err.kind(), ErrorKind::NoConnection);

        let err = client.end().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_retries_transient_failures() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script_connect_faults([ConnectFault::Refused, ConnectFault::Reset]);
        let client = SftpClient::new(transport.clone());

        client.connect(&config()).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_with_attempt_count() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script_connect_faults([ConnectFault::LookupFailed; 3]);
        let client = SftpClient::new(transport.clone());

        let err = client.connect(&config()).await.unwrap_err();
        assert_eq!(err.message, "connect: Address lookup failed for host after 3 attempts");
        assert_eq!(err.retry_count, Some(3));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_bad_credentials_are_not_retried() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script_connect_faults([ConnectFault::AuthRejected]);
        let client = SftpClient::new(transport.clone());

        let err = client.connect(&config()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BadAuth);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script_connect_faults([ConnectFault::Hang]);
        let client = SftpClient::new(transport.clone());

        let mut config = config().with_retry(RetryConfig::new(0));
        config.ssh.timeout_secs = 1;
        let err = client.connect(&config).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TimedOut);
        assert_eq!(err.retry_count, Some(1));
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected_before_connecting() {
        let transport = Arc::new(MemoryTransport::new());
        let client = SftpClient::new(transport.clone());

        let err = client.connect(&config().with_concurrency(0)).await.unwrap_err();
        assert_eq!(err.message, "connect: Batch size must be a positive integer, got 0");
        assert_eq!(transport.attempts(), 0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_second_connect_fails_without_retry() {
        let (transport, client) = connected().await;
        let err = client.connect(&config()).await.unwrap_err();
        assert_eq!(err.message, "connect: An existing SFTP connection is already defined");
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_relative_paths_resolve_against_cwd() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/home/sftp/docs/a.txt", "a");

        assert_eq!(client.cwd().await.unwrap(), "/home/sftp");
        let info = client.stat("./docs/a.txt").await.unwrap();
        assert_eq!(info.path, "/home/sftp/docs/a.txt");
        let info = client.stat("docs/../docs/a.txt").await.unwrap();
        assert_eq!(info.size, 1);
        assert_eq!(client.real_path("..").await.unwrap(), "/home");
    }

    #[tokio::test]
    async fn test_cwd_lookup_runs_under_the_guard() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/home/sftp/docs/a.txt", "a");
        transport.fs().fail_path("/home/sftp", PathFault::Disconnect);
        let baseline = listener_counts(&client);

        let err = client.stat("docs/a.txt").await.unwrap_err();
        assert_eq!(err.message, "stat: Unexpected end event raised by remote");
        assert_eq!(err.kind(), ErrorKind::UnexpectedTermination);
        assert!(!client.is_connected());
        assert_eq!(listener_counts(&client), baseline);
    }

    #[tokio::test]
    async fn test_put_get_round_trip_through_local_files() {
        let (transport, client) = connected().await;
        let dir = tempdir().unwrap();
        let local = dir.path().join("up.txt");
        std::fs::write(&local, "payload").unwrap();

        assert_eq!(client.put(&local, "up.txt").await.unwrap(), 7);
        assert_eq!(transport.fs().read_file("/home/sftp/up.txt").unwrap(), b"payload");

        let back = dir.path().join("down.txt");
        assert_eq!(client.get("/home/sftp/up.txt", &back).await.unwrap(), 7);
        assert_eq!(std::fs::read_to_string(&back).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_buffers_and_append() {
        let (_transport, client) = connected().await;
        client.put_buffer(b"one", "log.txt").await.unwrap();
        client.append(b"-two", "log.txt").await.unwrap();
        assert_eq!(client.get_buffer("log.txt").await.unwrap(), b"one-two");

        let err = client.get_buffer("missing.txt").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.starts_with("get: "));
    }

    #[tokio::test]
    async fn test_fast_transfers_match_streamed_content() {
        let (transport, client) = connected().await;
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let local = dir.path().join("big.bin");
        std::fs::write(&local, &data).unwrap();
        let options = FastTransferOptions {
            chunk_size: 1024,
            concurrency: 3,
        };

        assert_eq!(client.fast_put(&local, "big.bin", options).await.unwrap(), 10_000);
        assert_eq!(transport.fs().read_file("big.bin").unwrap(), data);

        let back = dir.path().join("back.bin");
        assert_eq!(client.fast_get("big.bin", &back, options).await.unwrap(), 10_000);
        assert_eq!(std::fs::read(&back).unwrap(), data);

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(client.fast_put(&empty, "empty.bin", options).await.unwrap(), 0);
        assert!(transport.fs().is_file("empty.bin"));
    }

    #[tokio::test]
    async fn test_mkdir_and_rmdir() {
        let (transport, client) = connected().await;

        let err = client.mkdir("a/b/c", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        client.mkdir("a/b/c", true).await.unwrap();
        assert!(transport.fs().is_dir("/home/sftp/a/b/c"));
        client.mkdir("a/b/c", true).await.unwrap();

        transport.fs().add_file("/home/sftp/a/b/file.txt", "x");
        let err = client.mkdir("a/b/file.txt/d", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPath);

        assert!(client.rmdir("a", false).await.is_err());
        let err = client.rmdir("a/b/file.txt", true).await.unwrap_err();
        assert_eq!(err.message, "rmdir: Bad path: /home/sftp/a/b/file.txt is not a directory");

        client.rmdir("a", true).await.unwrap();
        assert_eq!(client.exists("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recursive_rmdir_unlinks_symlinks_without_following() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/important/precious.db", "keep");
        transport.fs().add_file("/important/nested/more.db", "keep");
        transport.fs().add_file("/work/notes.txt", "n");
        transport.fs().add_file("/work/sub/deep.txt", "d");
        transport.fs().add_symlink("/work/link", "/important");
        transport.fs().add_symlink("/work/sub/up", "..");

        client.rmdir("/work", true).await.unwrap();

        assert!(transport.fs().paths_under("/work").is_empty());
        assert!(!transport.fs().is_dir("/work"));
        assert_eq!(transport.fs().read_file("/important/precious.db").unwrap(), b"keep");
        assert_eq!(transport.fs().read_file("/important/nested/more.db").unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_rmdir_refuses_symlink_root() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/important/precious.db", "keep");
        transport.fs().add_symlink("/alias", "/important");

        let err = client.rmdir("/alias", true).await.unwrap_err();
        assert_eq!(err.message, "rmdir: Bad path: /alias is not a directory");
        assert!(transport.fs().is_symlink("/alias"));
        assert!(transport.fs().is_file("/important/precious.db"));
    }

    #[tokio::test]
    async fn test_rmdir_zero_concurrency_removes_nothing() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/tree/a.txt", "a");
        let session = client.session().unwrap();

        let err = session.rmdir("/tree", true, 0).await.unwrap_err();
        assert_eq!(err.message, "rmdir: Batch size must be a positive integer, got 0");
        assert!(transport.fs().is_file("/tree/a.txt"));
    }

    #[tokio::test]
    async fn test_delete_rename_chmod() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/srv/old.txt", "x");

        client.rename("/srv/old.txt", "/srv/new.txt").await.unwrap();
        assert_eq!(client.exists("/srv/new.txt").await.unwrap(), Some(FileType::File));

        client.chmod("/srv/new.txt", 0o600).await.unwrap();
        assert_eq!(transport.fs().mode("/srv/new.txt"), Some(0o600));

        client.delete("/srv/new.txt", false).await.unwrap();
        assert_eq!(
            client.delete("/srv/new.txt", false).await.unwrap_err().code,
            ErrorCode::NotFound
        );
        client.delete("/srv/new.txt", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/d/b.txt", "");
        transport.fs().add_file("/d/a.log", "");
        transport.fs().add_dir("/d/sub");

        let names: Vec<String> = client
            .list("/d", None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a.log", "b.txt", "sub"]);

        let filter = TransferFilter::glob("*.txt").unwrap();
        let names: Vec<String> = client
            .list("/d", Some(&filter))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["b.txt", "sub"]);
    }

    #[tokio::test]
    async fn test_listeners_return_to_baseline() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/x.txt", "x");
        let baseline = listener_counts(&client);
        assert_eq!(baseline, (1, 1, 1));

        client.stat("/x.txt").await.unwrap();
        client.stat("/missing").await.unwrap_err();
        client.get_buffer("/x.txt").await.unwrap();
        client.mkdir("/x.txt", false).await.unwrap_err();
        assert_eq!(listener_counts(&client), baseline);
    }

    #[tokio::test]
    async fn test_remote_drop_yields_one_error_and_closes_session() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/x.txt", "x");
        transport.fs().fail_path("/x.txt", PathFault::Disconnect);

        let err = client.stat("/x.txt").await.unwrap_err();
        assert_eq!(err.message, "stat: Unexpected end event raised by remote");
        assert_eq!(err.kind(), ErrorKind::UnexpectedTermination);

        assert!(!client.is_connected());
        let err = client.stat("/").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoConnection);
    }

    #[tokio::test]
    async fn test_permission_fault_is_classified() {
        let (transport, client) = connected().await;
        transport.fs().add_file("/secret", "x");
        transport.fs().fail_path("/secret", PathFault::PermissionDenied);

        let err = client.get_buffer("/secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_end_is_quiet_and_allows_reconnect() {
        let (transport, client) = connected().await;
        let conn = transport.connection().unwrap();

        client.end().await.unwrap();
        assert!(conn.is_closed());
        assert!(!client.is_connected());
        assert!(client.session().is_none());
        assert_eq!(conn.events().listener_count(EventKind::End), 0);

        client.connect(&config()).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(transport.attempts(), 2);
    }
}
