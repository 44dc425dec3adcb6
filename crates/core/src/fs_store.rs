//! File store over a host directory with one subdirectory per workspace.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::fs_policy::normalize_workspace_path;
use crate::{traits::FileStore, Error, Result};

/// Directories listed by name but never descended into.
const OPAQUE_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Upper bound on entries returned by one listing.
const MAX_LISTED_ENTRIES: usize = 10_000;

/// Reads workspace files from `{root}/{workspace_id}/...`.
pub struct DirectoryFileStore {
    root: PathBuf,
}

impl DirectoryFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn workspace_dir(&self, workspace_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(workspace_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(workspace_id)),
            _ => Err(Error::SecurityViolation(format!(
                "Invalid workspace id: '{}'",
                workspace_id
            ))),
        }
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> Error {
    Error::internal(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl FileStore for DirectoryFileStore {
    async fn get_file_by_path(&self, workspace_id: &str, path: &str) -> Result<Option<String>> {
        let full = self
            .workspace_dir(workspace_id)?
            .join(normalize_workspace_path(path)?);

        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &full, e)),
        }
    }

    async fn get_files_by_workspace(&self, workspace_id: &str) -> Result<Vec<String>> {
        let base = self.workspace_dir(workspace_id)?;
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(relative) = pending.pop() {
            let dir = base.join(&relative);
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| storage_error("list", &dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| storage_error("list", &dir, e))?
            {
                if files.len() >= MAX_LISTED_ENTRIES {
                    tracing::warn!(workspace_id, limit = MAX_LISTED_ENTRIES, "Workspace listing truncated");
                    files.sort();
                    return Ok(files);
                }

                let name = entry.file_name();
                let path = relative.join(&name);
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| storage_error("stat", &entry.path(), e))?;

                let display = path.to_string_lossy().replace('\\', "/");
                if file_type.is_dir() {
                    if OPAQUE_DIRS.iter().any(|d| name == *d) {
                        files.push(display);
                    } else {
                        pending.push(path);
                    }
                } else {
                    files.push(display);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
