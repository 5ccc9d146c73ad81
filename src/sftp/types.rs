//! SFTP data types

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{fmt_error, ErrorCode, SftpError};

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: u64,
    /// Last access time (Unix timestamp)
    pub accessed: u64,
    /// Permission bits (e.g. `0o644`)
    pub permissions: u32,
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl FileType {
    /// Single-character type marker as shown by `ls -l`
    pub fn marker(&self) -> char {
        match self {
            FileType::File => '-',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::Unknown => '?',
        }
    }

    pub fn is_dir(&self) -> bool {
        *self == FileType::Directory
    }
}

/// Kind of a transfer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    File,
    Dir,
    /// A symbolic link, never followed
    Link,
}

/// One unit of work produced by the tree walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,
    pub kind: DescriptorKind,
}

impl Descriptor {
    pub fn is_dir(&self) -> bool {
        self.kind == DescriptorKind::Dir
    }

    pub fn is_link(&self) -> bool {
        self.kind == DescriptorKind::Link
    }
}

type FilterFn = dyn Fn(&str, bool) -> bool + Send + Sync;

/// Inclusion predicate applied per entry: `(source path, is_directory) -> include`
#[derive(Clone)]
pub struct TransferFilter(Arc<FilterFn>);

impl TransferFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, bool) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Admit every directory and the files whose name matches `pattern`
    pub fn glob(pattern: &str) -> Result<Self, SftpError> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| {
            fmt_error(
                format!("Invalid filter pattern {}: {}", pattern, e),
                "filter",
                Some(ErrorCode::GenericClient),
                None,
            )
        })?;
        Ok(Self::new(move |path, is_dir| {
            if is_dir {
                return true;
            }
            let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
            pattern.matches(name)
        }))
    }

    pub fn accepts(&self, path: &str, is_dir: bool) -> bool {
        (self.0)(path, is_dir)
    }
}

impl fmt::Debug for TransferFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferFilter(..)")
    }
}

/// Options recognised by `upload_dir` / `download_dir`
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Entry filter; directories are always created regardless of its verdict
    pub filter: Option<TransferFilter>,
    /// Batch size; falls back to the connection default
    pub concurrency: Option<usize>,
    /// Use the ranged parallel-chunk primitives instead of streaming
    pub use_fast_transfer: bool,
}

/// Tuning for `fast_get` / `fast_put`
#[derive(Debug, Clone, Copy)]
pub struct FastTransferOptions {
    pub chunk_size: usize,
    /// Chunks in flight per batch
    pub concurrency: usize,
}

impl Default for FastTransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: constants::FAST_CHUNK_SIZE,
            concurrency: constants::FAST_CHUNK_CONCURRENCY,
        }
    }
}

/// How a remote file is opened for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate
    Truncate,
    /// Create or append
    Append,
}

/// Constants for SFTP operations
pub mod constants {
    /// Default batch size for bulk transfers
    pub const DEFAULT_CONCURRENCY: usize = 10;

    /// Buffer size for streaming transfers
    pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

    /// Chunk size for ranged (fast) transfers
    pub const FAST_CHUNK_SIZE: usize = 64 * 1024;

    /// Ranged chunks in flight per batch
    pub const FAST_CHUNK_CONCURRENCY: usize = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_filter_admits_directories() {
        let filter = TransferFilter::glob("*file-1?.txt").unwrap();
        assert!(filter.accepts("/data/level1", true));
        assert!(filter.accepts("/data/file-12.txt", false));
        assert!(filter.accepts("C:\\data\\file-19.txt", false));
        assert!(!filter.accepts("/data/file-2.txt", false));
        assert!(!filter.accepts("/data/file-1.txt", false));
        assert!(!filter.accepts("/data/file-123.txt", false));
    }

    #[test]
    fn test_invalid_glob() {
        let err = TransferFilter::glob("[").unwrap_err();
        assert!(err.message.starts_with("filter: Invalid filter pattern ["));
    }

    #[test]
    fn test_file_type_marker() {
        assert_eq!(FileType::Directory.marker(), 'd');
        assert_eq!(FileType::File.marker(), '-');
        assert_eq!(FileType::Symlink.marker(), 'l');
        assert!(FileType::Directory.is_dir());
        assert!(!FileType::File.is_dir());
    }
}
