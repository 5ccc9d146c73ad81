//! In-process SFTP backend
//!
//! [`MemoryTransport`] hands out [`MemoryConnection`]s over a shared
//! [`MemoryFs`]: a flat map of absolute paths to files, directories and
//! symlinks with the same failure behaviour a real server shows (writes into
//! a missing parent fail, non-empty directories cannot be removed, rename
//! does not overwrite). Listings report links as links while `stat` and file
//! I/O follow them. Connect failures, per-path faults and remote disconnects can
//! be scripted, and concurrently open writers are counted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::debug;

use super::backend::{Connection, RemoteReader, RemoteWriter, Transport};
use super::events::{ConnectionEvent, EventHub};
use super::path_utils::{
    is_absolute_remote_path, join_remote_path, normalize_remote_path, parent_remote_path,
    remote_file_name,
};
use super::types::{FileInfo, FileType, WriteMode};
use crate::ssh::{SshConfig, SshError};

/// Scripted outcome of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFault {
    LookupFailed,
    Refused,
    Reset,
    AuthRejected,
    /// Never completes
    Hang,
}

impl ConnectFault {
    fn to_error(self, addr: &str) -> SshError {
        match self {
            ConnectFault::LookupFailed => SshError::AddressLookup(addr.to_string()),
            ConnectFault::Refused => SshError::ConnectionRefused(addr.to_string()),
            ConnectFault::Reset => SshError::ConnectionReset(addr.to_string()),
            ConnectFault::AuthRejected => {
                SshError::AuthenticationFailed("Authentication rejected by server".to_string())
            }
            ConnectFault::Hang => SshError::Timeout(addr.to_string()),
        }
    }
}

/// Failure injected for every operation touching a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFault {
    PermissionDenied,
    Failure,
    /// The remote drops the connection mid-operation
    Disconnect,
}

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
    Link { target: String },
}

impl Node {
    fn file_type(&self) -> FileType {
        match self {
            Node::Dir { .. } => FileType::Directory,
            Node::File { .. } => FileType::File,
            Node::Link { .. } => FileType::Symlink,
        }
    }
}

const MAX_LINK_HOPS: usize = 8;

/// Shared filesystem behind every connection of a [`MemoryTransport`]
pub struct MemoryFs {
    home: String,
    nodes: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<HashMap<String, PathFault>>,
    writers: AtomicUsize,
    peak_writers: AtomicUsize,
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

fn is_child(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len() && path.starts_with(prefix) && !path[prefix.len()..].contains('/')
}

fn is_descendant(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len() && path.starts_with(prefix)
}

impl MemoryFs {
    /// An empty filesystem with `home` (and its ancestors) present
    pub fn new(home: &str) -> Self {
        let fs = Self {
            home: normalize_remote_path(home),
            nodes: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            writers: AtomicUsize::new(0),
            peak_writers: AtomicUsize::new(0),
        };
        fs.nodes.lock().insert("/".to_string(), Node::Dir { mode: 0o755 });
        fs.add_dir(&fs.home.clone());
        fs
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    fn absolute(&self, path: &str) -> String {
        if is_absolute_remote_path(path) {
            normalize_remote_path(path)
        } else {
            normalize_remote_path(&join_remote_path(&self.home, path))
        }
    }

    /// Create a directory and any missing ancestors
    pub fn add_dir(&self, path: &str) {
        let path = self.absolute(path);
        let mut nodes = self.nodes.lock();
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_remote_path(&current, part);
            nodes
                .entry(current.clone())
                .or_insert(Node::Dir { mode: 0o755 });
        }
    }

    /// Create or replace a file, creating missing ancestors
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = self.absolute(path);
        self.add_dir(&parent_remote_path(&path));
        self.nodes.lock().insert(
            path,
            Node::File {
                data: data.into(),
                mode: 0o644,
            },
        );
    }

    /// Create a symlink at `path` pointing to `target`
    ///
    /// A relative `target` is taken relative to the link's directory.
    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = self.absolute(path);
        self.add_dir(&parent_remote_path(&path));
        self.nodes.lock().insert(
            path,
            Node::Link {
                target: target.to_string(),
            },
        );
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&self.absolute(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&self.absolute(path)), Some(Node::Dir { .. }))
    }

    pub fn is_file(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&self.absolute(path)), Some(Node::File { .. }))
    }

    pub fn is_symlink(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&self.absolute(path)), Some(Node::Link { .. }))
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.nodes.lock().get(&self.absolute(path)).map(|node| match node {
            Node::Dir { mode } | Node::File { mode, .. } => *mode,
            Node::Link { .. } => 0o777,
        })
    }

    /// Every path strictly below `root`, in lexical order
    pub fn paths_under(&self, root: &str) -> Vec<String> {
        let prefix = child_prefix(&self.absolute(root));
        self.nodes
            .lock()
            .keys()
            .filter(|p| is_descendant(&prefix, p))
            .cloned()
            .collect()
    }

    pub fn fail_path(&self, path: &str, fault: PathFault) {
        self.faults.lock().insert(self.absolute(path), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Most writers that were open at the same time
    pub fn peak_writers(&self) -> usize {
        self.peak_writers.load(Ordering::SeqCst)
    }

    pub fn reset_peak_writers(&self) {
        self.peak_writers.store(0, Ordering::SeqCst);
    }

    fn fault(&self, path: &str) -> Option<PathFault> {
        self.faults.lock().get(path).copied()
    }

    fn info(&self, path: &str, node: &Node) -> FileInfo {
        let (size, permissions) = match node {
            Node::Dir { mode } => (0, *mode),
            Node::File { data, mode } => (data.len() as u64, *mode),
            Node::Link { target } => (target.len() as u64, 0o777),
        };
        FileInfo {
            name: remote_file_name(path).to_string(),
            path: path.to_string(),
            file_type: node.file_type(),
            size,
            modified: 0,
            accessed: 0,
            permissions,
        }
    }

    fn require_parent_dir(&self, nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), SshError> {
        let parent = parent_remote_path(path);
        match nodes.get(&parent) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(_) => Err(SshError::Failure(format!("{} is not a directory", parent))),
            None => Err(SshError::NotFound(parent)),
        }
    }

    /// Follow `path` through symlinks to the node it names
    fn follow(&self, nodes: &BTreeMap<String, Node>, path: String) -> Result<String, SshError> {
        let mut current = path;
        for _ in 0..MAX_LINK_HOPS {
            match nodes.get(&current) {
                Some(Node::Link { target }) => {
                    current = if is_absolute_remote_path(target) {
                        normalize_remote_path(target)
                    } else {
                        normalize_remote_path(&join_remote_path(&parent_remote_path(&current), target))
                    };
                }
                _ => return Ok(current),
            }
        }
        Err(SshError::Failure(format!("Too many levels of symbolic links: {}", current)))
    }
}

/// Transport whose connections all share one [`MemoryFs`]
pub struct MemoryTransport {
    fs: Arc<MemoryFs>,
    connect_faults: Mutex<VecDeque<ConnectFault>>,
    attempts: AtomicUsize,
    last: Mutex<Option<Arc<MemoryConnection>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_home("/home/sftp")
    }

    pub fn with_home(home: &str) -> Self {
        Self {
            fs: Arc::new(MemoryFs::new(home)),
            connect_faults: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn fs(&self) -> &Arc<MemoryFs> {
        &self.fs
    }

    /// Fail the next connection attempts in order, one fault each
    pub fn script_connect_faults(&self, faults: impl IntoIterator<Item = ConnectFault>) {
        self.connect_faults.lock().extend(faults);
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The most recently opened connection
    pub fn connection(&self) -> Option<Arc<MemoryConnection>> {
        self.last.lock().clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn Connection>, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let fault = self.connect_faults.lock().pop_front();
        match fault {
            Some(ConnectFault::Hang) => std::future::pending().await,
            Some(fault) => return Err(fault.to_error(&config.address())),
            None => {}
        }

        let conn = Arc::new(MemoryConnection {
            fs: self.fs.clone(),
            events: Arc::new(EventHub::new()),
            closed: AtomicBool::new(false),
        });
        *self.last.lock() = Some(conn.clone());
        debug!("Memory connection opened for {}", config.address());
        Ok(conn)
    }
}

/// One connection to a [`MemoryFs`]
pub struct MemoryConnection {
    fs: Arc<MemoryFs>,
    events: Arc<EventHub>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise `event` as if it came from the remote side
    pub fn emit(&self, event: ConnectionEvent) {
        self.events.emit(event);
    }

    /// Remote hang-up: the channel ends, then the transport closes
    pub fn drop_remote(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(ConnectionEvent::End);
            self.events.emit(ConnectionEvent::Close);
        }
    }

    /// Simulated round trip plus connection and fault checks for `path`
    async fn enter(&self, path: &str) -> Result<String, SshError> {
        tokio::task::yield_now().await;
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        let path = self.fs.absolute(path);
        match self.fs.fault(&path) {
            None => Ok(path),
            Some(PathFault::PermissionDenied) => Err(SshError::PermissionDenied(path)),
            Some(PathFault::Failure) => Err(SshError::Failure(format!("Injected failure: {}", path))),
            Some(PathFault::Disconnect) => {
                self.drop_remote();
                tokio::task::yield_now().await;
                Err(SshError::Disconnected)
            }
        }
    }
}

struct WriterSlot {
    fs: Arc<MemoryFs>,
}

impl WriterSlot {
    fn acquire(fs: Arc<MemoryFs>) -> Self {
        let now = fs.writers.fetch_add(1, Ordering::SeqCst) + 1;
        fs.peak_writers.fetch_max(now, Ordering::SeqCst);
        Self { fs }
    }
}

impl Drop for WriterSlot {
    fn drop(&mut self) {
        self.fs.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryWriter {
    slot: WriterSlot,
    path: String,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut nodes = self.slot.fs.nodes.lock();
        match nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} vanished while writing", self.path),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    async fn real_path(&self, path: &str) -> Result<String, SshError> {
        self.enter(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SshError> {
        let path = self.enter(path).await?;
        let nodes = self.fs.nodes.lock();
        match nodes.get(&self.fs.follow(&nodes, path.clone())?) {
            Some(node) => Ok(self.fs.info(&path, node)),
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn link_stat(&self, path: &str) -> Result<FileInfo, SshError> {
        let path = self.enter(path).await?;
        match self.fs.nodes.lock().get(&path) {
            Some(node) => Ok(self.fs.info(&path, node)),
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SshError> {
        let path = self.enter(path).await?;
        let nodes = self.fs.nodes.lock();
        let target = self.fs.follow(&nodes, path.clone())?;
        match nodes.get(&target) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(SshError::Failure(format!("{} is not a directory", path))),
            None => return Err(SshError::NotFound(path)),
        }
        let prefix = child_prefix(&target);
        Ok(nodes
            .iter()
            .filter(|(p, _)| is_child(&prefix, p))
            .map(|(p, node)| {
                self.fs
                    .info(&join_remote_path(&path, remote_file_name(p)), node)
            })
            .collect())
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError> {
        let path = self.enter(path).await?;
        let nodes = self.fs.nodes.lock();
        match nodes.get(&self.fs.follow(&nodes, path.clone())?) {
            Some(Node::File { data, .. }) => Ok(Box::new(io::Cursor::new(data.clone()))),
            Some(_) => Err(SshError::Failure(format!("{} is a directory", path))),
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteWriter, SshError> {
        let path = self.enter(path).await?;
        let path = {
            let mut nodes = self.fs.nodes.lock();
            let path = self.fs.follow(&nodes, path)?;
            self.fs.require_parent_dir(&nodes, &path)?;
            match nodes.get_mut(&path) {
                Some(Node::Dir { .. }) | Some(Node::Link { .. }) => {
                    return Err(SshError::Failure(format!("{} is a directory", path)))
                }
                Some(Node::File { data, .. }) => {
                    if mode == WriteMode::Truncate {
                        data.clear();
                    }
                }
                None => {
                    nodes.insert(
                        path.clone(),
                        Node::File {
                            data: Vec::new(),
                            mode: 0o644,
                        },
                    );
                }
            }
            path
        };
        let writer = MemoryWriter {
            slot: WriterSlot::acquire(self.fs.clone()),
            path,
        };
        // Round trip for the open handle, so concurrent writers overlap
        tokio::task::yield_now().await;
        Ok(Box::new(writer))
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, SshError> {
        let path = self.enter(path).await?;
        let nodes = self.fs.nodes.lock();
        match nodes.get(&self.fs.follow(&nodes, path.clone())?) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(_) => Err(SshError::Failure(format!("{} is a directory", path))),
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn write_range(&self, path: &str, offset: u64, chunk: &[u8]) -> Result<(), SshError> {
        let path = self.enter(path).await?;
        let _slot = WriterSlot::acquire(self.fs.clone());
        let mut nodes = self.fs.nodes.lock();
        let target = self.fs.follow(&nodes, path.clone())?;
        match nodes.get_mut(&target) {
            Some(Node::File { data, .. }) => {
                let start = offset as usize;
                let end = start + chunk.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(chunk);
                Ok(())
            }
            Some(_) => Err(SshError::Failure(format!("{} is a directory", path))),
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SshError> {
        let path = self.enter(path).await?;
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(SshError::AlreadyExists(path));
        }
        self.fs.require_parent_dir(&nodes, &path)?;
        nodes.insert(path, Node::Dir { mode: 0o755 });
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SshError> {
        let path = self.enter(path).await?;
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(SshError::Failure(format!("{} is not a directory", path))),
            None => return Err(SshError::NotFound(path)),
        }
        let prefix = child_prefix(&path);
        if nodes.keys().any(|p| is_descendant(&prefix, p)) {
            return Err(SshError::Failure(format!("Directory not empty: {}", path)));
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        let path = self.enter(path).await?;
        let mut nodes = self.fs.nodes.lock();
        let file_type = nodes.get(&path).map(Node::file_type);
        match file_type {
            Some(FileType::Directory) => {
                Err(SshError::Failure(format!("{} is a directory", path)))
            }
            Some(_) => {
                nodes.remove(&path);
                Ok(())
            }
            None => Err(SshError::NotFound(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        let from = self.enter(from).await?;
        let to = self.enter(to).await?;
        let mut nodes = self.fs.nodes.lock();
        if !nodes.contains_key(&from) {
            return Err(SshError::NotFound(from));
        }
        if nodes.contains_key(&to) {
            return Err(SshError::Failure(format!("{} already exists", to)));
        }
        self.fs.require_parent_dir(&nodes, &to)?;

        let prefix = child_prefix(&from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| **p == from || is_descendant(&prefix, p))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn set_mode(&self, path: &str, new_mode: u32) -> Result<(), SshError> {
        let path = self.enter(path).await?;
        let mut nodes = self.fs.nodes.lock();
        let target = self.fs.follow(&nodes, path.clone())?;
        match nodes.get_mut(&target) {
            Some(Node::Dir { mode }) | Some(Node::File { mode, .. }) => {
                *mode = new_mode & 0o7777;
                Ok(())
            }
            Some(Node::Link { .. }) | None => Err(SshError::NotFound(path)),
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        tokio::task::yield_now().await;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(ConnectionEvent::End);
            self.events.emit(ConnectionEvent::Close);
        }
        Ok(())
    }
}
