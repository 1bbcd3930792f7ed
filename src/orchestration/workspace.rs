//! Scoped per-run workspaces.
//!
//! The `WorkspaceManager` owns every directory it hands out. A workspace is
//! created by the `CreateWorkspace` task, removed by `DestroyWorkspace`, and
//! whatever is still held when the run ends is removed by
//! [`WorkspaceManager::release_all`]. Removal happens at most once per
//! workspace however many of those paths fire.

use crate::core::run::RunId;
use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A workspace directory and its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceHandle {
    pub path: PathBuf,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl WorkspaceHandle {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}

/// Creates and tears down workspaces under a root directory.
///
/// Cloning is cheap and every clone tracks the same handles.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    handles: Arc<Mutex<Vec<WorkspaceHandle>>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, empty, uniquely named directory for `run_id`.
    pub async fn acquire(&self, run_id: &RunId) -> Result<WorkspaceHandle, TaskError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            TaskError::Workspace(format!("cannot create {}: {}", self.root.display(), e))
        })?;

        let suffix = Uuid::new_v4().simple().to_string();
        let path = self.root.join(format!("{}-{}", run_id, &suffix[..8]));
        fs::create_dir(&path).await.map_err(|e| {
            TaskError::Workspace(format!("cannot create {}: {}", path.display(), e))
        })?;

        let handle = WorkspaceHandle {
            path,
            run_id: run_id.clone(),
            created_at: Utc::now(),
            released_at: None,
        };
        info!(run = %run_id, path = %handle.path.display(), "workspace created");
        self.handles.lock().await.push(handle.clone());
        Ok(handle)
    }

    /// Remove the workspace at `path`.
    ///
    /// Returns `true` if this call removed it and `false` if it was already
    /// released or never existed. Paths the manager did not create are only
    /// accepted when they do not exist.
    pub async fn release(&self, path: &Path) -> Result<bool, TaskError> {
        let mut handles = self.handles.lock().await;
        let Some(handle) = handles.iter_mut().find(|h| h.path == path) else {
            if fs::try_exists(path).await.unwrap_or(false) {
                return Err(TaskError::Workspace(format!(
                    "{} is not a managed workspace",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "release of absent workspace");
            return Ok(false);
        };

        if handle.is_released() {
            debug!(path = %path.display(), "workspace already released");
            return Ok(false);
        }

        remove_tree(path).await?;
        handle.released_at = Some(Utc::now());
        info!(path = %path.display(), "workspace released");
        Ok(true)
    }

    /// Release every workspace still held.
    ///
    /// Errors are logged and the remaining workspaces are still attempted.
    /// Returns the paths removed by this call.
    pub async fn release_all(&self) -> Vec<PathBuf> {
        let mut handles = self.handles.lock().await;
        let mut released = Vec::new();
        for handle in handles.iter_mut().filter(|h| !h.is_released()) {
            match remove_tree(&handle.path).await {
                Ok(()) => {
                    handle.released_at = Some(Utc::now());
                    info!(path = %handle.path.display(), "workspace released at run end");
                    released.push(handle.path.clone());
                }
                Err(e) => {
                    warn!(path = %handle.path.display(), error = %e, "workspace release failed")
                }
            }
        }
        released
    }

    /// The most recently created workspace that is still held.
    pub async fn active(&self) -> Option<PathBuf> {
        self.handles
            .lock()
            .await
            .iter()
            .rev()
            .find(|h| !h.is_released())
            .map(|h| h.path.clone())
    }

    /// Snapshot of every handle, released or not.
    pub async fn handles(&self) -> Vec<WorkspaceHandle> {
        self.handles.lock().await.clone()
    }
}

async fn remove_tree(path: &Path) -> Result<(), TaskError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TaskError::Workspace(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}
