//! In-memory implementations of core traits for testing and simulation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::{traits::FileStore, Result};

// =============================================================================
// In-Memory File Store
// =============================================================================

/// File store backed by a map of workspace id to `path -> content`.
#[derive(Default)]
pub struct InMemoryFileStore {
    workspaces: DashMap<String, BTreeMap<String, String>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file.
    pub fn put(&self, workspace_id: &str, path: &str, content: impl Into<String>) {
        self.workspaces
            .entry(workspace_id.to_string())
            .or_default()
            .insert(path.to_string(), content.into());
    }

    /// Builder-style variant of [`put`](Self::put).
    pub fn with_file(self, workspace_id: &str, path: &str, content: impl Into<String>) -> Self {
        self.put(workspace_id, path, content);
        self
    }

    pub fn remove(&self, workspace_id: &str, path: &str) -> bool {
        self.workspaces
            .get_mut(workspace_id)
            .map(|mut files| files.remove(path).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn get_file_by_path(&self, workspace_id: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .workspaces
            .get(workspace_id)
            .and_then(|files| files.get(path).cloned()))
    }

    async fn get_files_by_workspace(&self, workspace_id: &str) -> Result<Vec<String>> {
        Ok(self
            .workspaces
            .get(workspace_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_files_are_scoped_per_workspace() {
        let store = InMemoryFileStore::new()
            .with_file("ws-a", "main.py", "print('a')")
            .with_file("ws-b", "main.go", "package main");

        assert_eq!(
            store.get_file_by_path("ws-a", "main.py").await.unwrap(),
            Some("print('a')".to_string())
        );
        assert!(store.get_file_by_path("ws-b", "main.py").await.unwrap().is_none());
        assert_eq!(
            store.get_files_by_workspace("ws-b").await.unwrap(),
            vec!["main.go".to_string()]
        );
        assert!(store.get_files_by_workspace("ws-c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = InMemoryFileStore::new().with_file("ws", "a.txt", "x");
        assert!(store.remove("ws", "a.txt"));
        assert!(!store.remove("ws", "a.txt"));
        assert!(store.get_files_by_workspace("ws").await.unwrap().is_empty());
    }
}
