//! SFTP engine module
//!
//! Provides the guarded SFTP client, single-file primitives and the bulk
//! transfer operations built on top of them.

pub mod backend;
pub mod bulk;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod memory;
pub mod path_utils;
pub mod retry;
pub mod session;
pub mod transfer;
pub mod types;
pub mod walker;

pub use backend::{Connection, RemoteReader, RemoteWriter, Transport};
pub use bulk::Transform;
pub use config::{ConfigError, ConnectConfig};
pub use error::{fmt_error, ErrorCode, ErrorKind, SftpError};
pub use events::{ConnectionEvent, EventHub, EventKind, ListenerId};
pub use memory::{ConnectFault, MemoryConnection, MemoryFs, MemoryTransport, PathFault};
pub use retry::{calculate_backoff, retry_connect, RetryConfig};
pub use session::{Session, SftpClient};
pub use transfer::{check_batch_size, partition, run_batched};
pub use types::*;
pub use walker::{walk, LocalTree, RemoteTree, TreeEntry, TreeSource};
