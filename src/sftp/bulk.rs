//! Directory and copy operations
//!
//! Each bulk operation runs under a single guard: the source tree is walked
//! once, destination directories are created parents-first, and file
//! transfers go through the batch scheduler on the shared connection.
//! Symlinks found inside a tree are skipped, never followed.

use std::path::Path;

use futures_util::FutureExt;
use tracing::{debug, info};

use super::error::{fmt_error, ErrorCode, SftpError};
use super::path_utils::{join_local_path, join_remote_path};
use super::session::{pipe, pipe_mapped, Session, SftpClient};
use super::transfer::{check_batch_size, run_batched, Task};
use super::types::{Descriptor, FastTransferOptions, FileType, TransferFilter, TransferOptions, WriteMode};
use super::walker::{walk, LocalTree, RemoteTree};

/// Rewrites file content chunk by chunk during [`SftpClient::copy_file`]
pub type Transform = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Directories are always part of the skeleton, whatever the filter says
fn with_directories(filter: Option<TransferFilter>) -> Option<TransferFilter> {
    filter.map(|f| TransferFilter::new(move |path, is_dir| is_dir || f.accepts(path, is_dir)))
}

/// `(directories, files)`; links are dropped
fn split(descriptors: Vec<Descriptor>, op_id: &str) -> (Vec<Descriptor>, Vec<Descriptor>) {
    let (links, entries): (Vec<_>, Vec<_>) = descriptors.into_iter().partition(|d| d.is_link());
    for link in &links {
        debug!("[{}] Skipping symlink {}", op_id, link.relative_path);
    }
    entries.into_iter().partition(|d| d.is_dir())
}

async fn check_local_dir_source(src: &Path, name: &str) -> Result<(), SftpError> {
    match tokio::fs::metadata(src).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SftpError::bad_path(
            name,
            format!("{} is not a directory", src.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SftpError::bad_path(
            name,
            format!("{} does not exist", src.display()),
        )),
        Err(e) => Err(fmt_error(e, name, None, None)),
    }
}

async fn prepare_local_dir_destination(dst: &Path, name: &str) -> Result<(), SftpError> {
    match tokio::fs::metadata(dst).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SftpError::bad_path(
            name,
            format!("{} is not a directory", dst.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dst).await.map_err(|e| {
                SftpError::bad_path(name, format!("unable to create {}: {}", dst.display(), e))
            })
        }
        Err(e) => Err(fmt_error(e, name, None, None)),
    }
}

async fn check_remote_source(
    session: &Session,
    src: &str,
    expected: FileType,
    name: &str,
) -> Result<(), SftpError> {
    match session
        .exists(src)
        .await
        .map_err(|e| fmt_error(e, name, None, None))?
    {
        None => Err(SftpError::bad_path(name, format!("{} does not exist", src))),
        Some(t) if t == expected => Ok(()),
        Some(_) if expected == FileType::Directory => Err(SftpError::bad_path(
            name,
            format!("{} is not a directory", src),
        )),
        Some(_) => Err(SftpError::bad_path(
            name,
            format!("{} is not a regular file", src),
        )),
    }
}

async fn prepare_remote_dir_destination(
    session: &Session,
    dst: &str,
    name: &str,
) -> Result<(), SftpError> {
    match session
        .exists(dst)
        .await
        .map_err(|e| fmt_error(e, name, None, None))?
    {
        Some(FileType::Directory) => Ok(()),
        Some(_) => Err(SftpError::bad_path(name, format!("{} is not a directory", dst))),
        None => session.mkdir(dst, true).await.map_err(|e| {
            SftpError::bad_path(name, format!("unable to create {}: {}", dst, e.message))
        }),
    }
}

async fn ensure_remote_dir(session: &Session, path: &str, name: &str) -> Result<(), SftpError> {
    match session
        .exists(path)
        .await
        .map_err(|e| fmt_error(e, name, None, None))?
    {
        Some(FileType::Directory) => Ok(()),
        Some(_) => Err(SftpError::bad_path(name, format!("{} is not a directory", path))),
        None => session
            .mkdir(path, false)
            .await
            .map_err(|e| fmt_error(e, name, None, None)),
    }
}

impl SftpClient {
    fn batch_size(&self, options: &TransferOptions, name: &str) -> Result<usize, SftpError> {
        check_batch_size(
            options
                .concurrency
                .unwrap_or_else(|| self.default_concurrency()),
            name,
        )
    }

    /// Upload the local directory `src` into remote directory `dst`.
    ///
    /// `dst` is created when missing. Returns `"<src> uploaded to <dst>"`.
    pub async fn upload_dir(
        &self,
        src: impl AsRef<Path>,
        dst: &str,
        options: TransferOptions,
    ) -> Result<String, SftpError> {
        const NAME: &str = "upload_dir";
        let src = src.as_ref();
        let session = self.active(NAME)?;
        let concurrency = self.batch_size(&options, NAME)?;
        let fast = options.use_fast_transfer;
        let filter = with_directories(options.filter);
        let op_id = uuid::Uuid::new_v4().to_string();

        let session_ref: &Session = &session;
        session
            .guarded(NAME, async {
                let dst = session_ref.resolve(dst, NAME).await?;
                info!("[{}] Uploading directory {} to {}", op_id, src.display(), dst);
                check_local_dir_source(src, NAME).await?;
                prepare_remote_dir_destination(session_ref, &dst, NAME).await?;

                let root = src.to_string_lossy();
                let descriptors = walk(&LocalTree, &root, filter.as_ref())
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let (dirs, files) = split(descriptors, &op_id);
                debug!("[{}] {} directories, {} files", op_id, dirs.len(), files.len());

                for d in &dirs {
                    ensure_remote_dir(session_ref, &join_remote_path(&dst, &d.relative_path), NAME)
                        .await?;
                }

                let tasks: Vec<Task<'_, u64>> = files
                    .iter()
                    .map(|d| {
                        let local = join_local_path(src, &d.relative_path);
                        let remote = join_remote_path(&dst, &d.relative_path);
                        async move {
                            if fast {
                                session_ref
                                    .fast_put(&local, &remote, FastTransferOptions::default())
                                    .await
                            } else {
                                session_ref.put(&local, &remote).await
                            }
                        }
                        .boxed()
                    })
                    .collect();
                let bytes: u64 = run_batched(tasks, concurrency)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?
                    .into_iter()
                    .sum();

                info!(
                    "[{}] Upload complete: {} files, {} bytes",
                    op_id,
                    files.len(),
                    bytes
                );
                Ok(format!("{} uploaded to {}", src.display(), dst))
            })
            .await
    }

    /// Download remote directory `src` into the local directory `dst`.
    ///
    /// `dst` is created when missing. Returns `"<src> downloaded to <dst>"`.
    pub async fn download_dir(
        &self,
        src: &str,
        dst: impl AsRef<Path>,
        options: TransferOptions,
    ) -> Result<String, SftpError> {
        const NAME: &str = "download_dir";
        let dst = dst.as_ref();
        let session = self.active(NAME)?;
        let concurrency = self.batch_size(&options, NAME)?;
        let fast = options.use_fast_transfer;
        let filter = with_directories(options.filter);
        let op_id = uuid::Uuid::new_v4().to_string();

        let session_ref: &Session = &session;
        session
            .guarded(NAME, async {
                let src = session_ref.resolve(src, NAME).await?;
                info!("[{}] Downloading directory {} to {}", op_id, src, dst.display());
                check_remote_source(session_ref, &src, FileType::Directory, NAME).await?;
                prepare_local_dir_destination(dst, NAME).await?;

                let tree = RemoteTree::new(session_ref.connection().clone());
                let descriptors = walk(&tree, &src, filter.as_ref())
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let (dirs, files) = split(descriptors, &op_id);
                debug!("[{}] {} directories, {} files", op_id, dirs.len(), files.len());

                for d in &dirs {
                    tokio::fs::create_dir_all(join_local_path(dst, &d.relative_path))
                        .await
                        .map_err(|e| fmt_error(e, NAME, None, None))?;
                }

                let tasks: Vec<Task<'_, u64>> = files
                    .iter()
                    .map(|d| {
                        let remote = join_remote_path(&src, &d.relative_path);
                        let local = join_local_path(dst, &d.relative_path);
                        async move {
                            if fast {
                                session_ref
                                    .fast_get(&remote, &local, FastTransferOptions::default())
                                    .await
                            } else {
                                session_ref.get(&remote, &local).await
                            }
                        }
                        .boxed()
                    })
                    .collect();
                let bytes: u64 = run_batched(tasks, concurrency)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?
                    .into_iter()
                    .sum();

                info!(
                    "[{}] Download complete: {} files, {} bytes",
                    op_id,
                    files.len(),
                    bytes
                );
                Ok(format!("{} downloaded to {}", src, dst.display()))
            })
            .await
    }

    /// Copy remote file `src` to `dst` on the same server, overwriting `dst`.
    ///
    /// The content is streamed; with a `transform`, every chunk passes
    /// through it. Returns the bytes written.
    pub async fn copy_file(
        &self,
        src: &str,
        dst: &str,
        transform: Option<Transform>,
    ) -> Result<u64, SftpError> {
        const NAME: &str = "copy_file";
        let session = self.active(NAME)?;

        session
            .guarded(NAME, async {
                let src = session.resolve(src, NAME).await?;
                let dst = session.resolve(dst, NAME).await?;
                check_remote_source(&session, &src, FileType::File, NAME).await?;

                let conn = session.connection();
                let mut reader = conn
                    .open_read(&src)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let mut writer = conn
                    .open_write(&dst, WriteMode::Truncate)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let written = match transform {
                    Some(transform) => pipe_mapped(&mut reader, &mut writer, transform).await,
                    None => pipe(&mut reader, &mut writer).await,
                }
                .map_err(|e| fmt_error(e, NAME, Some(ErrorCode::GenericClient), None))?;
                debug!("Copied {} to {} ({} bytes)", src, dst, written);
                Ok(written)
            })
            .await
    }

    /// Stream remote file `src` into a new remote file `dst`
    pub async fn rcopy(&self, src: &str, dst: &str) -> Result<u64, SftpError> {
        const NAME: &str = "rcopy";
        let session = self.active(NAME)?;

        session
            .guarded(NAME, async {
                let src = session.resolve(src, NAME).await?;
                let dst = session.resolve(dst, NAME).await?;
                check_remote_source(&session, &src, FileType::File, NAME).await?;
                if session
                    .exists(&dst)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?
                    .is_some()
                {
                    return Err(SftpError::bad_path(
                        NAME,
                        format!("destination {} already exists", dst),
                    ));
                }

                let conn = session.connection();
                let mut reader = conn
                    .open_read(&src)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let mut writer = conn
                    .open_write(&dst, WriteMode::Truncate)
                    .await
                    .map_err(|e| fmt_error(e, NAME, None, None))?;
                let copied = pipe(&mut reader, &mut writer)
                    .await
                    .map_err(|e| fmt_error(e, NAME, Some(ErrorCode::GenericClient), None))?;
                debug!("Remote copy {} -> {} ({} bytes)", src, dst, copied);
                Ok(copied)
            })
            .await
    }
}
