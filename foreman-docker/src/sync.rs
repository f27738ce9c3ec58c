//! File synchronization between the host and containers.
//!
//! Files travel over the container copy channel as tar archives: syncing a
//! directory into a container uploads a tar of it, and listing or syncing
//! out of a container downloads one.

use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;

use notify::RecursiveMode;
use notify::Watcher as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::Docker;
use crate::Error;
use crate::Result;

/// Metadata for one file inside a container.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file name, relative to the listed path.
    pub name: String,
    /// The size of the file in bytes.
    pub size: u64,
    /// The unix mode bits.
    pub mode: u32,
    /// The modification time as unix seconds.
    pub mod_time: i64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Builds a tar archive of the contents of a directory.
///
/// Entry names are relative to `source`.
pub(crate) fn build_tar(source: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", source)?;
    builder.into_inner()
}

/// Unpacks a tar archive into a directory.
pub(crate) fn unpack_tar(archive: &[u8], target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;

    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        entry.unpack_in(target)?;
    }

    Ok(())
}

/// Reads the entry metadata of a tar archive.
pub(crate) fn read_entries(archive: &[u8]) -> std::io::Result<Vec<FileInfo>> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        let header = entry.header();

        files.push(FileInfo {
            name: entry.path()?.display().to_string(),
            size: header.size()?,
            mode: header.mode()?,
            mod_time: header.mtime()? as i64,
            is_dir: header.entry_type().is_dir(),
        });
    }

    Ok(files)
}

impl Docker {
    /// Synchronizes a host directory into a container.
    ///
    /// The contents of `source_path` are uploaded under `target_path` inside
    /// the container.
    pub async fn sync_to_container(
        &self,
        source_path: impl Into<PathBuf>,
        target_path: impl AsRef<str>,
        container_id: impl AsRef<str>,
    ) -> Result<()> {
        let source = source_path.into();
        let archive = tokio::task::spawn_blocking(move || build_tar(&source))
            .await
            .map_err(|e| Error::Message(format!("tar task failed: {e}")))??;

        self.container_from_id(container_id.as_ref())
            .upload_tar(target_path.as_ref(), archive.into())
            .await
    }

    /// Synchronizes a path inside a container out to a host directory.
    pub async fn sync_from_container(
        &self,
        container_id: impl AsRef<str>,
        source_path: impl AsRef<str>,
        target_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let archive = self
            .container_from_id(container_id.as_ref())
            .download_tar(source_path.as_ref())
            .await?;

        let target = target_path.into();
        tokio::task::spawn_blocking(move || unpack_tar(&archive, &target))
            .await
            .map_err(|e| Error::Message(format!("tar task failed: {e}")))??;

        Ok(())
    }

    /// Lists the files under a path inside a container.
    pub async fn list_files(
        &self,
        container_id: impl AsRef<str>,
        path: impl AsRef<str>,
    ) -> Result<Vec<FileInfo>> {
        let archive = self
            .container_from_id(container_id.as_ref())
            .download_tar(path.as_ref())
            .await?;

        tokio::task::spawn_blocking(move || read_entries(&archive))
            .await
            .map_err(|e| Error::Message(format!("tar task failed: {e}")))?
            .map_err(Into::into)
    }

    /// Watches a host directory and re-synchronizes it into a container on
    /// every create or modify, until the token is canceled.
    pub async fn watch(
        &self,
        source_path: impl Into<PathBuf>,
        target_path: impl Into<String>,
        container_id: impl Into<String>,
        token: CancellationToken,
    ) -> Result<()> {
        let source = source_path.into();
        let target = target_path.into();
        let container_id = container_id.into();

        let (sender, mut receiver) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(
            move |event: notify::Result<notify::Event>| {
                // The watcher invokes this on its own thread.
                let _ = sender.blocking_send(event);
            },
        )?;
        watcher.watch(&source, RecursiveMode::Recursive)?;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(Ok(event)) if matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) => {
                        debug!(container = %container_id, "change detected; syncing");
                        if let Err(e) = self
                            .sync_to_container(&source, &target, &container_id)
                            .await
                        {
                            warn!("error syncing changes: {e}");
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("error watching files: {e}"),
                    None => break,
                },
            }
        }

        Ok(())
    }
}
