//! Workspace file store traits.

use crate::error::Result;
use async_trait::async_trait;

/// Read-only view of a workspace's persisted files.
///
/// The sandbox engine uses this for language detection and dependency
/// bootstrap heuristics; it never writes through it.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Content of a file, or `None` when the workspace has no such path.
    async fn get_file_by_path(&self, workspace_id: &str, path: &str) -> Result<Option<String>>;

    /// Every file path in the workspace, relative to its root.
    async fn get_files_by_workspace(&self, workspace_id: &str) -> Result<Vec<String>>;
}
