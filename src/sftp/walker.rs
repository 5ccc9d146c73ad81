//! Tree enumeration for bulk transfers
//!
//! [`walk`] turns a local or remote directory tree into an ordered list of
//! [`Descriptor`]s: depth-first, each directory listed before its contents,
//! siblings in name order. Traversal uses an explicit worklist, so the walk
//! is independent of how the resulting transfers are executed. Symbolic
//! links are reported as links and never descended into.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::backend::Connection;
use super::error::{fmt_error, SftpError};
use super::path_utils::join_remote_path;
use super::types::{Descriptor, DescriptorKind, FileType, TransferFilter};

/// One child of a directory being walked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: DescriptorKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, kind: DescriptorKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A tree the walker can enumerate
#[async_trait]
pub trait TreeSource: Send + Sync {
    /// Children of `dir`, typed without following links. Entries that are
    /// neither files, directories nor links are left out.
    async fn entries(&self, dir: &str) -> Result<Vec<TreeEntry>, SftpError>;

    /// Path of child `name` inside `dir`
    fn join(&self, dir: &str, name: &str) -> String;
}

/// The local filesystem
pub struct LocalTree;

#[async_trait]
impl TreeSource for LocalTree {
    async fn entries(&self, dir: &str) -> Result<Vec<TreeEntry>, SftpError> {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| fmt_error(e, "walk", None, None))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| fmt_error(e, "walk", None, None))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(meta) if meta.is_symlink() => DescriptorKind::Link,
                Ok(meta) if meta.is_dir() => DescriptorKind::Dir,
                Ok(meta) if meta.is_file() => DescriptorKind::File,
                Ok(_) => {
                    debug!("Skipping special file {}", entry.path().display());
                    continue;
                }
                Err(e) => {
                    warn!("Skipping unreadable entry {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            entries.push(TreeEntry::new(name, kind));
        }
        Ok(entries)
    }

    fn join(&self, dir: &str, name: &str) -> String {
        Path::new(dir).join(name).to_string_lossy().to_string()
    }
}

/// A tree on the remote side of a connection
pub struct RemoteTree {
    conn: Arc<dyn Connection>,
}

impl RemoteTree {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TreeSource for RemoteTree {
    async fn entries(&self, dir: &str) -> Result<Vec<TreeEntry>, SftpError> {
        let listing = self
            .conn
            .read_dir(dir)
            .await
            .map_err(|e| fmt_error(e, "walk", None, None))?;

        let mut entries = Vec::with_capacity(listing.len());
        for info in listing {
            let kind = match info.file_type {
                FileType::Directory => DescriptorKind::Dir,
                FileType::File => DescriptorKind::File,
                FileType::Symlink => DescriptorKind::Link,
                FileType::Unknown => {
                    debug!("Skipping special file {}", info.path);
                    continue;
                }
            };
            entries.push(TreeEntry::new(info.name, kind));
        }
        Ok(entries)
    }

    fn join(&self, dir: &str, name: &str) -> String {
        join_remote_path(dir, name)
    }
}

struct Frame {
    relative: String,
    path: String,
    pending: VecDeque<TreeEntry>,
}

async fn open_frame(
    source: &dyn TreeSource,
    relative: String,
    path: String,
) -> Result<Frame, SftpError> {
    let mut children = source.entries(&path).await?;
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Frame {
        relative,
        path,
        pending: children.into(),
    })
}

/// Enumerate everything below `root`.
///
/// The filter sees each entry's full source path and whether it is a
/// directory (links count as non-directories). Rejected entries are left out
/// of the result, but rejected directories are still descended into.
pub async fn walk(
    source: &dyn TreeSource,
    root: &str,
    filter: Option<&TransferFilter>,
) -> Result<Vec<Descriptor>, SftpError> {
    let mut descriptors = Vec::new();
    let mut stack = vec![open_frame(source, String::new(), root.to_string()).await?];

    while let Some(frame) = stack.last_mut() {
        let Some(entry) = frame.pending.pop_front() else {
            stack.pop();
            continue;
        };
        let relative = if frame.relative.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", frame.relative, entry.name)
        };
        let path = source.join(&frame.path, &entry.name);

        let is_dir = entry.kind == DescriptorKind::Dir;
        if filter.map_or(true, |f| f.accepts(&path, is_dir)) {
            descriptors.push(Descriptor {
                relative_path: relative.clone(),
                kind: entry.kind,
            });
        }

        if is_dir {
            let child = open_frame(source, relative, path).await?;
            stack.push(child);
        }
    }

    debug!("Walked {}: {} descriptor(s)", root, descriptors.len());
    Ok(descriptors)
}
