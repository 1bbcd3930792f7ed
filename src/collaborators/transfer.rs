//! Remote file transfer.
//!
//! Sensors list a remote glob through [`TransferClient::list`] and transfer
//! tasks pull whole directories with [`TransferClient::download`]. The
//! protocol behind a connection id is opaque to the engine.

use crate::error::TaskError;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A named connection to a remote file store.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Remote paths matching `pattern` (a glob such as `/Taxi/cmt/*`).
    async fn list(&self, pattern: &str) -> Result<Vec<String>, TaskError>;

    /// Recursively copy the remote directory `remote` into `local`.
    ///
    /// Returns the number of files transferred.
    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TaskError>;
}

/// A local directory standing in for a remote file store.
///
/// Remote paths are interpreted relative to `root`, so `/Taxi/cmt` maps to
/// `<root>/Taxi/cmt`.
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    root: PathBuf,
}

impl LocalTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> Result<PathBuf, TaskError> {
        let relative = remote.trim_start_matches('/');
        if Path::new(relative)
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            return Err(TaskError::Transfer(format!(
                "remote path escapes connection root: {}",
                remote
            )));
        }
        Ok(self.root.join(relative))
    }

    fn to_remote(&self, local: &Path) -> String {
        let relative = local.strip_prefix(&self.root).unwrap_or(local);
        format!("/{}", relative.display())
    }
}

#[async_trait]
impl TransferClient for LocalTransfer {
    async fn list(&self, pattern: &str) -> Result<Vec<String>, TaskError> {
        self.resolve(pattern)?;
        // Only the caller's pattern is glob syntax; the root matches literally.
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let full = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            pattern.trim_start_matches('/')
        );
        let this = self.clone();

        tokio::task::spawn_blocking(move || {
            let paths = glob::glob(&full)
                .map_err(|e| TaskError::Transfer(format!("invalid pattern {}: {}", full, e)))?;

            let mut matches = Vec::new();
            for entry in paths {
                let path = entry.map_err(|e| TaskError::Transfer(e.to_string()))?;
                matches.push(this.to_remote(&path));
            }
            matches.sort();
            Ok(matches)
        })
        .await
        .map_err(|e| TaskError::Transfer(format!("listing task panicked: {}", e)))?
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TaskError> {
        let source = self.resolve(remote)?;
        let dest = local.to_path_buf();
        debug!(source = %source.display(), dest = %dest.display(), "download");

        tokio::task::spawn_blocking(move || {
            if !source.is_dir() {
                return Err(TaskError::Transfer(format!(
                    "source unreachable: {}",
                    source.display()
                )));
            }
            copy_tree(&source, &dest).map_err(|e| {
                TaskError::Transfer(format!("cannot write {}: {}", dest.display(), e))
            })
        })
        .await
        .map_err(|e| TaskError::Transfer(format!("download task panicked: {}", e)))?
    }
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
