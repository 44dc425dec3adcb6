//! Workspace path policy.
//!
//! File paths arrive from callers as workspace-relative strings. Before one is
//! turned into a path inside a container it is normalized here, so a request
//! can never address anything outside the mounted workspace.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a workspace-relative path.
///
/// Leading `./` segments are dropped and `..` is resolved lexically. Absolute
/// paths (Unix or Windows style), paths that climb above the workspace root,
/// and paths that normalize to nothing are rejected.
pub fn normalize_workspace_path(input_path: &str) -> Result<PathBuf> {
    if input_path.len() >= 2
        && input_path.as_bytes()[1] == b':'
        && input_path.as_bytes()[0].is_ascii_alphabetic()
    {
        return Err(Error::SecurityViolation(format!(
            "Absolute paths are not allowed in a workspace: {}",
            input_path
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(input_path).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::SecurityViolation(format!(
                        "Path escapes the workspace: {}",
                        input_path
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::SecurityViolation(format!(
                    "Absolute paths are not allowed in a workspace: {}",
                    input_path
                )));
            }
            Component::CurDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::invalid_request(format!(
            "Path does not name a file: '{}'",
            input_path
        )));
    }

    Ok(normalized)
}

/// Map a workspace-relative path to its location under `mount_path` inside
/// the workspace container.
pub fn container_path(mount_path: &str, input_path: &str) -> Result<String> {
    let relative = normalize_workspace_path(input_path)?;
    let joined = Path::new(mount_path).join(relative);
    Ok(joined.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert_eq!(
            normalize_workspace_path("main.py").unwrap(),
            PathBuf::from("main.py")
        );
        assert_eq!(
            normalize_workspace_path("./src/app.js").unwrap(),
            PathBuf::from("src/app.js")
        );
        assert_eq!(
            normalize_workspace_path("src/../lib/util.rb").unwrap(),
            PathBuf::from("lib/util.rb")
        );
    }

    #[test]
    fn test_escape_rejection() {
        assert!(normalize_workspace_path("../etc/passwd").is_err());
        assert!(normalize_workspace_path("src/../../etc/passwd").is_err());
        assert!(normalize_workspace_path("/etc/passwd").is_err());
        assert!(normalize_workspace_path("C:\\Windows\\System32").is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(matches!(
            normalize_workspace_path("./"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_container_path_joins_mount() {
        assert_eq!(
            container_path("/workspace", "src/main.go").unwrap(),
            "/workspace/src/main.go"
        );
    }
}
