//! Centralized path utilities

use std::path::{Component, Path, PathBuf};

const CONFIG_DIR_NAME: &str = ".tandem";

/// Get the tandem config directory (~/.tandem)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the config file (~/.tandem/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the logs directory (~/.tandem/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `path` against `root` and make sure it stays inside it
///
/// Returns `None` for anything that escapes the root.
pub fn resolve_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize(&joined);
    // Follow symlinks for paths that exist so a link can't point outside
    let resolved = normalized.canonicalize().unwrap_or(normalized);
    resolved.starts_with(root).then_some(resolved)
}

/// `path` relative to `root` when possible
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }

    #[test]
    fn test_resolve_within() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), "x").unwrap();

        assert_eq!(
            resolve_within(&root, Path::new("a.txt")),
            Some(root.join("a.txt"))
        );
        assert_eq!(
            resolve_within(&root, Path::new("new/file.rs")),
            Some(root.join("new/file.rs"))
        );
        assert_eq!(resolve_within(&root, Path::new("../escape")), None);
        assert_eq!(resolve_within(&root, Path::new("/etc/passwd")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        assert_eq!(resolve_within(&root, Path::new("link")), None);
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/p"), Path::new("/p/src/a.rs")),
            PathBuf::from("src/a.rs")
        );
        assert_eq!(
            relative_to(Path::new("/p"), Path::new("/q/a.rs")),
            PathBuf::from("/q/a.rs")
        );
    }
}
